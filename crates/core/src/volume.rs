use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ResolveError;

// scheme://authority/id, authority may be empty (aws:///vol-...)
static EBS_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.-]*)://(?P<authority>[^/]*)/(?P<id>[^/]+)$")
        .unwrap()
});

/// Opaque backend volume identifier, e.g. `vol-06c8c738cdfc1703c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl AsRef<str> for VolumeId {
    fn as_ref(&self) -> &str { &self.0 }
}

/// Parsed form of the URI carried by an EBS-backed volume record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EbsVolumeUri {
    pub scheme: String,
    /// Availability zone for in-tree EBS volumes; may be empty.
    pub authority: String,
    pub volume_id: VolumeId,
}

impl EbsVolumeUri {
    pub fn parse(uri: &str) -> Result<Self, ResolveError> {
        let caps = EBS_URI
            .captures(uri)
            .ok_or_else(|| ResolveError::VolumeIdNotFound { uri: uri.to_string() })?;
        let field = |name: &str| caps.name(name).map(|m| m.as_str().to_string()).unwrap_or_default();
        Ok(Self { scheme: field("scheme"), authority: field("authority"), volume_id: VolumeId(field("id")) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_trailing_segment_with_zone() {
        let u = EbsVolumeUri::parse("aws://eu-central-1c/vol-06c8c738cdfc1703c").unwrap();
        assert_eq!(u.scheme, "aws");
        assert_eq!(u.authority, "eu-central-1c");
        assert_eq!(u.volume_id.as_str(), "vol-06c8c738cdfc1703c");
    }

    #[test]
    fn accepts_empty_authority() {
        let u = EbsVolumeUri::parse("aws:///vol-0abc").unwrap();
        assert_eq!(u.authority, "");
        assert_eq!(u.volume_id.to_string(), "vol-0abc");
    }

    #[test]
    fn parse_is_deterministic() {
        let a = EbsVolumeUri::parse("aws://us-east-1a/vol-1").unwrap();
        let b = EbsVolumeUri::parse("aws://us-east-1a/vol-1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_non_matching_strings() {
        for bad in ["vol-06c8c738cdfc1703c", "aws://eu-central-1c/", "aws://zone/a/b", "", "://zone/vol-1", "aws:/zone/vol-1"] {
            match EbsVolumeUri::parse(bad) {
                Err(ResolveError::VolumeIdNotFound { uri }) => assert_eq!(uri, bad),
                other => panic!("expected VolumeIdNotFound for {bad:?}, got {other:?}"),
            }
        }
    }
}
