//! Request handling on the controller
//!
//! [`Controller`] owns the lock registry, the inventory database, instance
//! presence and in-flight uploads. It is driven by one task, which makes it
//! the single logical owner of every player's lock and record: requests for
//! the same player are handled strictly one after another.

use crate::database::DatabaseStore;
use crate::instance_manager::InstanceManager;
use crate::lock_registry::{AcquireOutcome, LockRegistry, ReleaseOutcome};
use log::{debug, error, info, warn};
use shared::chunker::{self, ChunkSet, Reassembly};
use shared::config::ControllerConfig;
use shared::metrics::SyncMetrics;
use shared::{Chunk, DatabaseStats, InstanceId, PlayerKey, Request, Response, Result, NOT_HOLDER};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Chunk size used when streaming records to instances.
pub const DOWNLOAD_CHUNK_SIZE: usize = chunker::DEFAULT_CHUNK_SIZE;

/// An upload whose chunks are still arriving
struct PendingUpload {
    chunks: ChunkSet,
    base_version: Option<u64>,
}

/// What was last committed for a player by an instance, so a retransmitted
/// final chunk gets the same answer instead of a second commit.
struct CommitReceipt {
    digest: String,
    base_version: Option<u64>,
    version: u64,
}

type TransferKey = (PlayerKey, InstanceId);

pub struct Controller {
    config: ControllerConfig,
    registry: LockRegistry,
    database: DatabaseStore,
    instances: InstanceManager,
    uploads: HashMap<TransferKey, PendingUpload>,
    receipts: HashMap<TransferKey, CommitReceipt>,
    metrics: Arc<SyncMetrics>,
}

impl Controller {
    pub fn new(config: ControllerConfig, database: DatabaseStore, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            registry: LockRegistry::new(config.player_lock_timeout, config.max_lock_timeout),
            config,
            database,
            instances: InstanceManager::new(),
            uploads: HashMap::new(),
            receipts: HashMap::new(),
            metrics,
        }
    }

    /// Handles one request from `from` and returns the responses to send back
    pub fn handle(&mut self, request: Request, from: SocketAddr, now_ms: u64) -> Vec<Response> {
        if let Some(instance_id) = request.instance_id() {
            if !matches!(request, Request::Goodbye { .. }) {
                self.instances.touch(instance_id, from);
            }
        }

        match request {
            Request::Hello { .. } => vec![Response::Welcome],

            Request::Goodbye { instance_id } => {
                self.disconnect(&instance_id);
                Vec::new()
            }

            Request::Acquire {
                player,
                instance_id,
                timeout_secs,
            } => match self.registry.acquire(&player, &instance_id, timeout_secs, now_ms) {
                AcquireOutcome::Granted { expires_at_ms } => {
                    self.metrics.lock_granted();
                    vec![Response::Acquired { expires_at_ms }]
                }
                AcquireOutcome::Denied(denial) => {
                    self.metrics.lock_denied();
                    vec![Response::AcquireDenied { denial }]
                }
            },

            Request::Release {
                player,
                instance_id,
            } => {
                let key = (player, instance_id);
                self.uploads.remove(&key);
                self.receipts.remove(&key);
                match self.registry.release(&key.0, &key.1) {
                    ReleaseOutcome::Released => {
                        self.metrics.lock_released();
                        vec![Response::Released]
                    }
                    ReleaseOutcome::NotReleased { reason } => vec![Response::ReleaseRefused {
                        reason: reason.to_string(),
                    }],
                }
            }

            Request::Upload {
                player,
                instance_id,
                base_version,
                chunk,
            } => vec![self.upload(player, instance_id, base_version, chunk, now_ms)],

            Request::Download {
                player,
                instance_id,
            } => self.download(&player, &instance_id, now_ms),

            Request::DatabaseStats => vec![Response::Stats(self.stats())],
        }
    }

    fn upload(
        &mut self,
        player: PlayerKey,
        instance_id: InstanceId,
        base_version: Option<u64>,
        chunk: Chunk,
        now_ms: u64,
    ) -> Response {
        let key = (player, instance_id);

        if self.registry.live_holder(&key.0, now_ms) != Some(&key.1) {
            self.uploads.remove(&key);
            self.metrics.upload_rejected();
            warn!(
                "Upload chunk {}/{} of {} from {} rejected: not the lock holder",
                chunk.index, chunk.total, key.0, key.1
            );
            return Response::UploadRejected {
                reason: NOT_HOLDER.to_string(),
            };
        }

        if !chunk.in_range() {
            warn!(
                "Upload chunk {}/{} of {} from {} discarded: index out of range",
                chunk.index, chunk.total, key.0, key.1
            );
            return Response::UploadFailed {
                reason: format!("chunk index {} out of range 0..{}", chunk.index, chunk.total),
            };
        }

        if let Some(receipt) = self.receipts.get(&key) {
            if receipt.digest == chunk.digest && receipt.base_version == base_version {
                debug!("Repeated chunk of committed upload of {}", key.0);
                return if chunk.is_last() {
                    Response::UploadCommitted {
                        version: receipt.version,
                    }
                } else {
                    Response::UploadAck {
                        chunk_index: chunk.index,
                    }
                };
            }
        }

        let fresh = || PendingUpload {
            chunks: ChunkSet::from_chunk(key.0.clone(), &chunk),
            base_version,
        };
        let pending = self.uploads.entry(key.clone()).or_insert_with(fresh);
        // A chunk of a different transfer means the instance restarted its upload
        if pending.chunks.total != chunk.total
            || pending.chunks.digest != chunk.digest
            || pending.base_version != base_version
        {
            *pending = fresh();
        }

        let index = chunk.index;
        let inserted = pending.chunks.insert(chunk);

        match inserted {
            Ok(Reassembly::Incomplete { received, total }) => {
                debug!("Upload of {}: {}/{} chunks", key.0, received, total);
                Response::UploadAck { chunk_index: index }
            }
            Ok(Reassembly::Complete(payload)) => {
                self.uploads.remove(&key);
                self.commit(key, payload, base_version, now_ms)
            }
            Err(e) => {
                self.uploads.remove(&key);
                warn!("Upload of {} from {} discarded: {}", key.0, key.1, e);
                Response::UploadFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn commit(
        &mut self,
        key: TransferKey,
        payload: Vec<u8>,
        base_version: Option<u64>,
        now_ms: u64,
    ) -> Response {
        let (player, writer) = &key;
        let digest = chunker::payload_digest(&payload);
        let size = payload.len();
        // Holder is read again here, the chunks may have taken a while
        let holder = self.registry.live_holder(player, now_ms).cloned();

        match self
            .database
            .put(player, payload, writer, holder.as_ref(), base_version, now_ms)
        {
            Ok(version) => {
                self.metrics.upload_committed(size);
                info!(
                    "Stored inventory of {} from {} ({} bytes, version {})",
                    player, writer, size, version
                );
                self.receipts.insert(
                    key,
                    CommitReceipt {
                        digest,
                        base_version,
                        version,
                    },
                );
                Response::UploadCommitted { version }
            }
            Err(e) => {
                self.metrics.upload_rejected();
                Response::UploadRejected {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn download(&mut self, player: &PlayerKey, instance_id: &InstanceId, now_ms: u64) -> Vec<Response> {
        if self.registry.live_holder(player, now_ms) != Some(instance_id) {
            warn!(
                "Download of {} by {} refused: not the lock holder",
                player, instance_id
            );
            return vec![Response::DownloadRejected {
                reason: NOT_HOLDER.to_string(),
            }];
        }

        let (version, payload) = match self.database.get(player) {
            Some(record) => (record.version, record.payload.as_slice()),
            None => (0, &[][..]),
        };

        match chunker::transfer_frames(payload, DOWNLOAD_CHUNK_SIZE) {
            Ok(frames) => {
                self.metrics.downloaded(payload.len());
                debug!(
                    "Sending inventory of {} to {} in {} chunks",
                    player,
                    instance_id,
                    frames.len()
                );
                frames
                    .into_iter()
                    .map(|chunk| Response::DownloadChunk { version, chunk })
                    .collect()
            }
            Err(e) => vec![Response::DownloadRejected {
                reason: e.to_string(),
            }],
        }
    }

    /// Drops everything held by an instance that said goodbye
    pub fn disconnect(&mut self, instance_id: &InstanceId) {
        self.instances.remove(instance_id);
        self.registry.on_instance_disconnect(instance_id);
        self.uploads.retain(|(_, owner), _| owner != instance_id);
        self.receipts.retain(|(_, owner), _| owner != instance_id);
    }

    /// Periodic housekeeping: expire locks and abandon stalled uploads
    pub fn tick(&mut self, now_ms: u64) {
        let expired = self.registry.expiry_sweep(now_ms);
        if !expired.is_empty() {
            self.metrics.locks_expired(expired.len());
        }

        let timeout = self.config.transfer_timeout;
        let metrics = &self.metrics;
        self.uploads.retain(|(player, owner), pending| {
            if pending.chunks.is_expired(timeout) {
                metrics.transfer_abandoned();
                warn!(
                    "Abandoned upload of {} from {}: {}",
                    player,
                    owner,
                    pending.chunks.incomplete_error()
                );
                false
            } else {
                true
            }
        });

        let registry = &self.registry;
        self.receipts
            .retain(|(player, owner), _| registry.live_holder(player, now_ms) == Some(owner));
    }

    /// Persists the database if it changed
    pub fn save(&mut self) -> Result<()> {
        self.database.save().inspect_err(|e| error!("Autosave failed: {}", e))
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            active_locks: self.registry.len() as u64,
            pending_uploads: self.uploads.len() as u64,
            ..self.database.stats()
        }
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn database(&self) -> &DatabaseStore {
        &self.database
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }
}
