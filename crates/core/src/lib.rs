//! kube-tagger core types: watched objects, tag sets and the capability seams
//! the event handler is wired against.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod tags;
pub mod volume;

pub use error::{ApplyError, BoxError, ConfigError, ParseError, ResolveError};
pub use tags::{extract_tags, filter_blacklisted, is_blacklisted, merge_tags, parse_default_tag, parse_tag_list, ParsedTags};
pub use volume::{EbsVolumeUri, VolumeId};

/// Tag key to tag value. Ordered only so logs and tests are stable.
pub type TagSet = BTreeMap<String, String>;

/// Gate annotation: only claims provisioned by the in-tree EBS provisioner are handled.
pub const PROVISIONER_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-provisioner";
pub const EBS_PROVISIONER: &str = "kubernetes.io/aws-ebs";
/// Separator-delimited `key=value` list of additional tags.
pub const TAG_LIST_ANNOTATION: &str = "volume.beta.kubernetes.io/additional-resource-tags";
/// Overrides [`DEFAULT_SEPARATOR`] for the tag list on the same object.
pub const SEPARATOR_ANNOTATION: &str = "volume.beta.kubernetes.io/additional-resource-tags-separator";
pub const DEFAULT_SEPARATOR: &str = ",";

/// Read-only projection of a claim as delivered by the watch transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchedObject {
    pub name: String,
    pub namespace: Option<String>,
    pub annotations: BTreeMap<String, String>,
    /// Name of the bound storage volume (empty until the claim is bound).
    pub volume_name: Option<String>,
}

impl WatchedObject {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Eligibility predicate.
    pub fn is_ebs_provisioned(&self) -> bool {
        self.annotation(PROVISIONER_ANNOTATION) == Some(EBS_PROVISIONER)
    }

    /// Separator for the tag list: the override annotation if set and non-empty, else `,`.
    pub fn tag_separator(&self) -> &str {
        match self.annotation(SEPARATOR_ANNOTATION) {
            Some("") => {
                tracing::warn!(pvc = %self.key(), "empty tag separator annotation; using default");
                DEFAULT_SEPARATOR
            }
            Some(sep) => {
                tracing::debug!(pvc = %self.key(), separator = %sep, "custom tag separator defined");
                sep
            }
            None => DEFAULT_SEPARATOR,
        }
    }

    /// `namespace/name`, or just `name` for objects without a namespace.
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationKind {
    /// Add or update seen on the watch stream (including relists).
    Applied,
    /// Periodic redelivery of an already known object.
    Resync,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub object: WatchedObject,
}

/// Maps a volume binding name to the backend URI of the volume record.
#[async_trait::async_trait]
pub trait VolumeLookup: Send + Sync {
    /// Returns the URI-shaped identifier carried by the record's backend source.
    async fn backend_uri(&self, volume_name: &str) -> Result<String, ResolveError>;
}

/// Pluggable tagging backend. Implementations must be idempotent: re-tagging
/// with the same values is a no-op on the provider side.
#[async_trait::async_trait]
pub trait TagApplier: Send + Sync {
    /// Short backend name for logs and metrics labels.
    fn backend(&self) -> &'static str;

    async fn create_tags(&self, volume_id: &VolumeId, tags: &TagSet) -> Result<(), ApplyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(annotations: &[(&str, &str)]) -> WatchedObject {
        WatchedObject {
            name: "data".into(),
            namespace: Some("ns".into()),
            annotations: annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            volume_name: Some("pv-1".into()),
        }
    }

    #[test]
    fn eligibility_requires_exact_provisioner_value() {
        assert!(claim(&[(PROVISIONER_ANNOTATION, EBS_PROVISIONER)]).is_ebs_provisioned());
        assert!(!claim(&[]).is_ebs_provisioned());
        assert!(!claim(&[(PROVISIONER_ANNOTATION, "ebs.csi.aws.com")]).is_ebs_provisioned());
        assert!(!claim(&[("other", EBS_PROVISIONER)]).is_ebs_provisioned());
    }

    #[test]
    fn separator_defaults_and_overrides() {
        assert_eq!(claim(&[]).tag_separator(), ",");
        assert_eq!(claim(&[(SEPARATOR_ANNOTATION, ";")]).tag_separator(), ";");
        assert_eq!(claim(&[(SEPARATOR_ANNOTATION, "")]).tag_separator(), ",");
    }

    #[test]
    fn key_includes_namespace_when_present() {
        let mut o = claim(&[]);
        assert_eq!(o.key(), "ns/data");
        o.namespace = None;
        assert_eq!(o.key(), "data");
    }

    #[test]
    fn notification_serializes_kind() {
        let n = Notification { kind: NotificationKind::Resync, object: claim(&[]) };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["kind"], "Resync");
        assert_eq!(v["object"]["volume_name"], "pv-1");
    }
}
