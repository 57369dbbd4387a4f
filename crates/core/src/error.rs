use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Startup-only failures. Any of these aborts the process before the watch loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid tag format {0:?}, expected key=value")]
    InvalidTagFormat(String),
    #[error("kubernetes client: {0}")]
    KubeConfig(#[source] BoxError),
    #[error("cloud session: {0}")]
    Cloud(String),
}

/// A single malformed tag-list entry; siblings are still processed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid tag entry {entry:?}, expected key=value")]
    InvalidEntry { entry: String },
    /// Splits into two parts but the key is empty; EC2 rejects empty keys.
    #[error("tag entry {entry:?} has an empty key")]
    EmptyKey { entry: String },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("claim is not bound to a volume")]
    MissingVolumeName,
    #[error("fetching volume {volume}: {source}")]
    Lookup {
        volume: String,
        #[source]
        source: BoxError,
    },
    #[error("volume {volume} is not an EBS volume")]
    NotEbsVolume { volume: String },
    #[error("couldn't find volume id in {uri:?}")]
    VolumeIdNotFound { uri: String },
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("tagging {volume_id} failed: {source}")]
    Backend {
        volume_id: String,
        #[source]
        source: BoxError,
    },
}
