//! kube-tagger EBS backend: tags volumes through EC2 `CreateTags`.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2 as ec2;
use aws_sdk_ec2::error::DisplayErrorContext;
use tagger_core::{ApplyError, ConfigError, TagApplier, TagSet, VolumeId};
use tracing::{debug, info};

pub struct EbsTagger {
    client: ec2::Client,
}

impl EbsTagger {
    pub fn new(client: ec2::Client) -> Self { Self { client } }

    /// Load the ambient AWS configuration (env, profile, IMDS/IRSA). A session
    /// without a resolvable region is rejected up front.
    pub async fn from_env() -> Result<Self, ConfigError> {
        let conf = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let region = conf
            .region()
            .ok_or_else(|| ConfigError::Cloud("no AWS region configured".to_string()))?;
        info!(region = %region, "aws session ready");
        Ok(Self::new(ec2::Client::new(&conf)))
    }
}

pub fn to_ec2_tags(tags: &TagSet) -> Vec<ec2::types::Tag> {
    tags.iter()
        .map(|(k, v)| ec2::types::Tag::builder().key(k).value(v).build())
        .collect()
}

#[async_trait]
impl TagApplier for EbsTagger {
    fn backend(&self) -> &'static str { "ebs" }

    async fn create_tags(&self, volume_id: &VolumeId, tags: &TagSet) -> Result<(), ApplyError> {
        debug!(volume_id = %volume_id, count = tags.len(), "creating tags");
        self.client
            .create_tags()
            .resources(volume_id.as_str())
            .set_tags(Some(to_ec2_tags(tags)))
            .send()
            .await
            .map_err(|e| ApplyError::Backend {
                volume_id: volume_id.to_string(),
                // the plain SdkError display drops the service message
                source: DisplayErrorContext(e).to_string().into(),
            })?;
        Ok(())
    }
}
