//! Error types shared by the control-plane components

use std::path::PathBuf;

use thiserror::Error;

use crate::core::download::DownloadError;

/// Control-plane error type.
///
/// Every variant belongs to one of the families surfaced to callers:
/// process, config, network, validation, name conflict and filesystem.
#[derive(Error, Debug)]
pub enum Error {
    /// `stop()` was requested while no core is live
    #[error("no running core")]
    NotRunning,

    /// The core binary could not be spawned
    #[error("failed to start core: {0}")]
    Spawn(#[source] std::io::Error),

    /// Any other process-level failure
    #[error("process error: {0}")]
    Process(String),

    /// Missing or structurally unusable config input
    #[error("config error: {0}")]
    Config(String),

    /// A YAML document could not be parsed
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Transport failure or non-success HTTP status
    #[error("network error: {0}")]
    Network(#[from] DownloadError),

    /// Release metadata did not have the expected shape
    #[error("invalid release metadata: {0}")]
    Release(String),

    /// The core rejected a config in check mode
    #[error("invalid config: {0}")]
    Validation(String),

    /// No free deduplicated subscription name
    #[error("no available name for {0}")]
    NameConflict(String),

    /// A subscription lookup failed
    #[error("subscription {0} not found")]
    UnknownSubscription(String),

    /// Permission, ownership, move or archive failures
    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Settings persistence failure
    #[error("settings store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl Error {
    /// Wrap an I/O error with a short description of what was attempted.
    pub fn fs(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Filesystem {
            context: context.into(),
            source,
        }
    }
}

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;
