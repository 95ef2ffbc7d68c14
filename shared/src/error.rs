//! Error taxonomy shared by the controller and the instances.

use thiserror::Error;

/// Every failure the synchronization protocol can surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("inventory of {player} is locked by {}", .holder.as_deref().unwrap_or("another instance"))]
    LockConflict {
        player: String,
        holder: Option<String>,
    },

    #[error("lock on {player} expired before the checkout completed")]
    LockExpired { player: String },

    #[error("invalid lock timeout {requested}s (must be between 1 and {max})")]
    InvalidTimeout { requested: u64, max: u64 },

    #[error("transfer of {player} incomplete: {received} of {total} chunks received")]
    TransferIncomplete {
        player: String,
        received: u32,
        total: u32,
    },

    #[error("payload digest mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("chunk does not belong to this transfer: {0}")]
    ChunkMismatch(String),

    #[error("transfer of {player} rejected: {reason}")]
    TransferRejected { player: String, reason: String },

    #[error("game bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid player name {0:?}")]
    InvalidPlayerKey(String),

    #[error("chunk size must be positive")]
    InvalidChunkSize,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the failure is transient and worth another attempt after a backoff.
    ///
    /// Lock conflicts are left to the caller, and a rejected transfer means
    /// our lock is stale, so neither is retried here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransferIncomplete { .. }
                | SyncError::IntegrityMismatch { .. }
                | SyncError::BridgeUnavailable(_)
                | SyncError::Network(_)
        )
    }
}

impl From<bincode::Error> for SyncError {
    fn from(err: bincode::Error) -> Self {
        SyncError::Network(format!("codec: {}", err))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
