//! Error types for the AI employee vault.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Unit error: {0}")]
    Unit(#[from] UnitError),

    #[error("Posting error: {0}")]
    Post(#[from] PostError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised while moving unit-of-work files between stage directories.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The source disappeared before the move (another process moved it first).
    #[error("Source file no longer exists: {0}")]
    SourceMissing(PathBuf),

    /// Source and destination live on different filesystems; the move cannot be atomic.
    #[error("Cannot move {from} to {to}: crosses filesystem boundary, atomic move unavailable")]
    CrossDevice { from: PathBuf, to: PathBuf },

    #[error("Transition from {from} to {to} is not allowed")]
    InvalidTransition { from: String, to: String },

    #[error("Path is outside the vault: {0}")]
    NotInVault(PathBuf),

    #[error("Invalid agent name: {0:?}")]
    InvalidAgent(String),

    #[error("Path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl QueueError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Unit-of-work file read/write errors.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("Unit file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UnitError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { path, source }
        }
    }
}

/// Posting worker errors.
#[derive(Debug, thiserror::Error)]
pub enum PostError {
    /// A required metadata field is absent. The message is recorded verbatim
    /// in the unit's `error` field.
    #[error("{0}")]
    MissingField(String),

    #[error("Platform {platform} is not configured: {reason}")]
    NotConfigured { platform: String, reason: String },

    #[error("Send to {platform} failed: {reason}")]
    SendFailed { platform: String, reason: String },

    #[error("{platform} rejected the request: {reason}")]
    Rejected { platform: String, reason: String },

    #[error("Platform {platform} unavailable, retry after {retry_after:?}")]
    Unavailable {
        platform: String,
        retry_after: Option<Duration>,
    },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

impl PostError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SendFailed { .. } | Self::Unavailable { .. })
    }
}

/// Approval gate errors.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("{approver} is not an authorized approver")]
    Unauthorized { approver: String },

    #[error("{0} is not awaiting approval")]
    NotPending(PathBuf),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
