//! Types shared by the inventory controller and the game-server instances.
//!
//! The protocol is a set of explicit request/response variants carried in a
//! [`Packet`]. Player names are validated when they enter the system through
//! [`PlayerKey`], including when they are decoded off the wire.

pub mod chunker;
pub mod config;
pub mod error;
pub mod metrics;

pub use chunker::{Chunk, ChunkSet, Reassembly};
pub use error::{Result, SyncError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest datagram the controller and instances exchange.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Case-normalized player name identifying one inventory record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlayerKey(String);

impl PlayerKey {
    pub fn new(name: &str) -> Result<Self> {
        let normalized = name.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(SyncError::InvalidPlayerKey(name.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PlayerKey {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<PlayerKey> for String {
    fn from(key: PlayerKey) -> Self {
        key.0
    }
}

impl fmt::Display for PlayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of one game-server process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a lock was not granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockDenial {
    Held { holder: InstanceId },
    InvalidTimeout { requested: u64, max: u64 },
}

impl LockDenial {
    /// Short machine readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            LockDenial::Held { .. } => "held",
            LockDenial::InvalidTimeout { .. } => "invalid-timeout",
        }
    }

    pub fn into_error(self, player: &PlayerKey) -> SyncError {
        match self {
            LockDenial::Held { holder } => SyncError::LockConflict {
                player: player.to_string(),
                holder: Some(holder.0),
            },
            LockDenial::InvalidTimeout { requested, max } => {
                SyncError::InvalidTimeout { requested, max }
            }
        }
    }
}

/// Reason reported when a release is refused.
pub const NOT_HOLDER: &str = "not-holder";

/// Requests sent by instances to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Hello {
        instance_id: InstanceId,
    },
    Goodbye {
        instance_id: InstanceId,
    },
    Acquire {
        player: PlayerKey,
        instance_id: InstanceId,
        timeout_secs: Option<u64>,
    },
    Release {
        player: PlayerKey,
        instance_id: InstanceId,
    },
    Upload {
        player: PlayerKey,
        instance_id: InstanceId,
        /// Version the instance downloaded; `None` skips the version check
        base_version: Option<u64>,
        chunk: Chunk,
    },
    Download {
        player: PlayerKey,
        instance_id: InstanceId,
    },
    DatabaseStats,
}

impl Request {
    /// Sender of the request, if it names one.
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            Request::Hello { instance_id }
            | Request::Goodbye { instance_id }
            | Request::Acquire { instance_id, .. }
            | Request::Release { instance_id, .. }
            | Request::Upload { instance_id, .. }
            | Request::Download { instance_id, .. } => Some(instance_id),
            Request::DatabaseStats => None,
        }
    }
}

/// Answers sent by the controller. A download produces several responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Welcome,
    Acquired { expires_at_ms: u64 },
    AcquireDenied { denial: LockDenial },
    Released,
    ReleaseRefused { reason: String },
    UploadAck { chunk_index: u32 },
    UploadCommitted { version: u64 },
    /// The upload came from an instance that no longer holds the lock or is
    /// based on an outdated version; retrying the same upload will not help.
    UploadRejected { reason: String },
    /// The partial upload was discarded and has to be restarted.
    UploadFailed { reason: String },
    DownloadChunk { version: u64, chunk: Chunk },
    DownloadRejected { reason: String },
    Stats(DatabaseStats),
}

/// Summary of the inventory database and lock table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub record_count: u64,
    pub total_bytes: u64,
    pub active_locks: u64,
    pub pending_uploads: u64,
}

/// Everything that travels between instances and the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Request { request_id: u32, request: Request },
    Response { request_id: u32, response: Response },
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Current unix time in milliseconds.
pub fn timestamp_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}
