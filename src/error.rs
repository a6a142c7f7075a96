//! Error types for Courier.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the bot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Messaging session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel {name} disconnected: {reason}")]
    Disconnected { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Channel {name} logged out; the session must be paired again")]
    LoggedOut { name: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },
}

impl ChannelError {
    /// Whether the send is worth retrying once the session is open again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Disconnected { .. } | Self::RateLimited { .. } | Self::StartupFailed { .. }
        )
    }
}

/// Job bookkeeping errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("A download into {} is already in progress", path.display())]
    DuplicateDestination { path: PathBuf },
}

/// Per-item acquisition failures. Reported to the requester, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid source reference: {0}")]
    InvalidReference(String),

    #[error("torrent advertises no files")]
    EmptyTorrent,

    #[error("torrent has {count} file(s), index {index} does not exist")]
    FileNotInTorrent { index: usize, count: usize },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Failure to hand a completed file to a relay target.
///
/// Never rolls back the job; the file stays on disk.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Could not read {} for relay: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Delivery to {target} failed: {source}")]
    Delivery {
        target: String,
        #[source]
        source: ChannelError,
    },
}
