//! Instance side state machine for one player's inventory
//!
//! A checkout takes the player's lock on the controller, pulls the stored
//! inventory and hands it to the game engine. A checkin reads the inventory
//! back out of the engine, pushes it to the controller and gives the lock
//! back:
//!
//! ```text
//! Idle -> Acquiring -> Downloading -> Applying -> AwaitingLocalChange
//! AwaitingLocalChange -> Extracting -> Uploading -> Releasing -> Idle
//! ```
//!
//! Any step may divert through `Aborting`, which always ends in `Idle`.
//!
//! ## Failure handling
//!
//! Transport failures, incomplete or corrupted transfers and an unresponsive
//! engine are retried with the [`RetryPolicy`]. Lock denials are returned to
//! the caller immediately. A rejected upload is never simply resent: the lock
//! is re-acquired once and the upload restarted from its first chunk, and if
//! that is refused the pending change is given up.
//!
//! The lock is released on the way out only while no local change can exist
//! yet. Once the engine has the inventory, a failed checkin leaves the lock
//! to expire instead, so a later retry or the expiry decides what happens,
//! never a half-finished release.

use crate::bridge::RconBridge;
use crate::link::{ControllerLink, UploadReply};
use crate::retry::RetryPolicy;
use log::{debug, error, info, warn};
use shared::chunker::{self, ChunkSet, Reassembly};
use shared::config::InstanceConfig;
use shared::metrics::SyncMetrics;
use shared::{PlayerKey, Result, SyncError};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Idle,
    Acquiring,
    Downloading,
    Applying,
    AwaitingLocalChange,
    Extracting,
    Uploading,
    Releasing,
    Aborting,
}

impl SyncState {
    /// States in which the engine cannot hold a changed inventory yet
    fn before_apply(self) -> bool {
        matches!(
            self,
            SyncState::Acquiring | SyncState::Downloading | SyncState::Applying
        )
    }
}

/// Transient state of one checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    pub player: PlayerKey,
    pub state: SyncState,
    /// Expiry of our lock as last reported by the controller
    pub lock_expires_at_ms: u64,
    /// Version of the record that was downloaded, sent along with the upload
    pub base_version: Option<u64>,
}

pub struct SyncCoordinator {
    player: PlayerKey,
    session: Option<SyncSession>,
    link: Arc<dyn ControllerLink>,
    bridge: Arc<dyn RconBridge>,
    config: InstanceConfig,
    policy: RetryPolicy,
    metrics: Arc<SyncMetrics>,
}

impl SyncCoordinator {
    pub fn new(
        player: PlayerKey,
        link: Arc<dyn ControllerLink>,
        bridge: Arc<dyn RconBridge>,
        config: InstanceConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            player,
            session: None,
            link,
            bridge,
            policy: RetryPolicy::from_config(&config),
            config,
            metrics,
        }
    }

    pub fn player(&self) -> &PlayerKey {
        &self.player
    }

    pub fn state(&self) -> SyncState {
        self.session
            .as_ref()
            .map_or(SyncState::Idle, |session| session.state)
    }

    pub fn session(&self) -> Option<&SyncSession> {
        self.session.as_ref()
    }

    fn set_state(&mut self, state: SyncState) {
        if let Some(session) = self.session.as_mut() {
            debug!("{}: {:?} -> {:?}", self.player, session.state, state);
            session.state = state;
        }
    }

    /// Takes the lock, downloads the stored inventory and applies it in game
    pub async fn checkout(&mut self) -> Result<()> {
        if self.state() != SyncState::Idle {
            return Err(SyncError::InvalidState(format!(
                "checkout of {} while {:?}",
                self.player,
                self.state()
            )));
        }

        self.session = Some(SyncSession {
            player: self.player.clone(),
            state: SyncState::Acquiring,
            lock_expires_at_ms: 0,
            base_version: None,
        });

        let expires_at_ms = match self.acquire().await {
            Ok(expires_at_ms) => expires_at_ms,
            Err(e) => {
                // Nothing is held, nothing to release
                self.session = None;
                return Err(e);
            }
        };
        if let Some(session) = self.session.as_mut() {
            session.lock_expires_at_ms = expires_at_ms;
        }

        self.set_state(SyncState::Downloading);
        let this = &*self;
        let download = this
            .policy
            .run("download", || this.download_once())
            .await;
        let (version, payload) = match download {
            Ok(record) => record,
            Err(e) => return Err(self.abort_checkout(e).await),
        };
        self.metrics.downloaded(payload.len());

        self.set_state(SyncState::Applying);
        let this = &*self;
        let applied = this
            .policy
            .run("apply", || {
                this.bridge
                    .apply(&this.player, &payload, this.config.bridge_timeout)
            })
            .await;
        if let Err(e) = applied {
            return Err(self.abort_checkout(e).await);
        }

        if let Some(session) = self.session.as_mut() {
            session.base_version = Some(version);
        }
        self.set_state(SyncState::AwaitingLocalChange);
        info!(
            "Checked out {} at version {} ({} bytes)",
            self.player,
            version,
            payload.len()
        );
        Ok(())
    }

    async fn acquire(&self) -> Result<u64> {
        let result = self
            .policy
            .run("acquire", || self.link.acquire(&self.player, None))
            .await;
        match &result {
            Ok(_) => self.metrics.lock_granted(),
            Err(SyncError::LockConflict { .. }) | Err(SyncError::InvalidTimeout { .. }) => {
                self.metrics.lock_denied()
            }
            Err(_) => {}
        }
        result
    }

    /// One attempt at pulling the record, bounded by the transfer timeout
    async fn download_once(&self) -> Result<(u64, Vec<u8>)> {
        let mut stream = self.link.download(&self.player).await?;

        let first = tokio::time::timeout(self.config.request_timeout, stream.next_frame(&self.player))
            .await
            .map_err(|_| {
                SyncError::Network(format!("no reply to download of {}", self.player))
            })??;
        let Some((version, chunk)) = first else {
            return Err(SyncError::Network(format!(
                "download of {} ended before any data",
                self.player
            )));
        };

        let deadline = Instant::now() + self.config.transfer_timeout;
        let mut set = ChunkSet::from_chunk(self.player.clone(), &chunk);
        let mut progress = set.insert(chunk)?;

        loop {
            if let Reassembly::Complete(payload) = progress {
                return Ok((version, payload));
            }

            match tokio::time::timeout_at(deadline, stream.next_frame(&self.player)).await {
                Ok(Ok(Some((frame_version, chunk)))) if frame_version == version => {
                    progress = set.insert(chunk)?;
                }
                Ok(Ok(Some((frame_version, _)))) => {
                    warn!(
                        "Download of {} mixed versions {} and {}",
                        self.player, version, frame_version
                    );
                    return Err(set.incomplete_error());
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(None)) | Err(_) => return Err(set.incomplete_error()),
            }
        }
    }

    /// Gives up a checkout that has not reached the engine, releasing the lock
    async fn abort_checkout(&mut self, cause: SyncError) -> SyncError {
        warn!("Checkout of {} failed: {}", self.player, cause);
        self.set_state(SyncState::Aborting);
        self.release().await;
        self.session = None;
        cause
    }

    /// Extracts the inventory from the engine, uploads it and releases the lock
    ///
    /// Returns the version the controller stored.
    pub async fn checkin(&mut self) -> Result<u64> {
        let base_version = match &self.session {
            Some(session) if session.state == SyncState::AwaitingLocalChange => session.base_version,
            _ => {
                return Err(SyncError::InvalidState(format!(
                    "checkin of {} while {:?}",
                    self.player,
                    self.state()
                )))
            }
        };

        self.set_state(SyncState::Extracting);
        let this = &*self;
        let extracted = this
            .policy
            .run("extract", || {
                this.bridge.extract(&this.player, this.config.bridge_timeout)
            })
            .await;
        let payload = match extracted {
            Ok(payload) => payload,
            Err(e) => {
                // Keep the lock and the change, the caller may try again
                warn!("Could not extract inventory of {}: {}", self.player, e);
                self.set_state(SyncState::AwaitingLocalChange);
                return Err(e);
            }
        };

        self.set_state(SyncState::Uploading);
        let version = match self.upload_with_reacquire(&payload, base_version).await {
            Ok(version) => version,
            Err(e) => {
                self.metrics.transfer_abandoned();
                error!(
                    "Abandoned pending inventory change of {} ({} bytes): {}",
                    self.player,
                    payload.len(),
                    e
                );
                self.set_state(SyncState::Aborting);
                self.session = None;
                return Err(e);
            }
        };
        self.metrics.upload_committed(payload.len());
        info!("Checked in {} as version {}", self.player, version);

        self.set_state(SyncState::Releasing);
        self.release().await;
        self.session = None;
        Ok(version)
    }

    async fn upload_with_reacquire(&mut self, payload: &[u8], base_version: Option<u64>) -> Result<u64> {
        let rejection = match self.upload(payload, base_version).await {
            Err(rejection @ SyncError::TransferRejected { .. }) => rejection,
            other => return other,
        };
        self.metrics.upload_rejected();
        warn!("{}, re-acquiring lock once", rejection);

        match self.link.acquire(&self.player, None).await {
            Ok(expires_at_ms) => {
                self.metrics.lock_granted();
                if let Some(session) = self.session.as_mut() {
                    session.lock_expires_at_ms = expires_at_ms;
                }
                let result = self.upload(payload, base_version).await;
                if let Err(SyncError::TransferRejected { .. }) = &result {
                    self.metrics.upload_rejected();
                }
                result
            }
            Err(e) => {
                warn!("Re-acquiring lock on {} failed: {}", self.player, e);
                Err(rejection)
            }
        }
    }

    /// Sends every chunk, restarting from the first one when the controller
    /// lost track of the transfer
    async fn upload(&self, payload: &[u8], base_version: Option<u64>) -> Result<u64> {
        let mut attempt = 1;
        loop {
            match self.upload_pass(payload, base_version).await {
                Err(e @ SyncError::TransferIncomplete { .. })
                    if attempt < self.policy.max_attempts() =>
                {
                    let delay = self.policy.delay_for(attempt);
                    warn!("Restarting upload of {} in {:?}: {}", self.player, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn upload_pass(&self, payload: &[u8], base_version: Option<u64>) -> Result<u64> {
        let frames = chunker::transfer_frames(payload, self.config.rcon_chunk_size)?;
        let total = frames.len() as u32;

        for chunk in frames {
            let index = chunk.index;
            let reply = self
                .policy
                .run("upload chunk", || {
                    self.link
                        .upload_chunk(&self.player, base_version, chunk.clone())
                })
                .await?;

            match reply {
                UploadReply::Committed(version) => return Ok(version),
                UploadReply::Ack(acked) if acked == index => {
                    debug!("Upload of {}: chunk {}/{} acknowledged", self.player, index, total)
                }
                UploadReply::Ack(acked) => {
                    return Err(SyncError::ChunkMismatch(format!(
                        "sent chunk {} of {} but chunk {} was acknowledged",
                        index, self.player, acked
                    )))
                }
            }
        }

        // Last chunk acknowledged without a commit: earlier chunks never arrived
        Err(SyncError::TransferIncomplete {
            player: self.player.to_string(),
            received: total.saturating_sub(1),
            total,
        })
    }

    async fn release(&self) {
        match self.link.release(&self.player).await {
            Ok(true) => {
                self.metrics.lock_released();
                debug!("Released lock on {}", self.player);
            }
            Ok(false) => info!("Lock on {} was no longer ours to release", self.player),
            Err(e) => warn!("Release of {} failed, lock will expire: {}", self.player, e),
        }
    }

    /// Renews the lock of an active checkout
    ///
    /// A denial means another instance took the player over after our lock
    /// expired; it is reported as [`SyncError::LockExpired`].
    pub async fn heartbeat(&mut self) -> Result<()> {
        if self.state() != SyncState::AwaitingLocalChange {
            return Ok(());
        }

        match self.link.acquire(&self.player, None).await {
            Ok(expires_at_ms) => {
                if let Some(session) = self.session.as_mut() {
                    session.lock_expires_at_ms = expires_at_ms;
                }
                debug!("Lock on {} renewed until {}", self.player, expires_at_ms);
                Ok(())
            }
            Err(SyncError::LockConflict { holder, .. }) => {
                warn!(
                    "Lost lock on {} to {}",
                    self.player,
                    holder.as_deref().unwrap_or("another instance")
                );
                Err(SyncError::LockExpired {
                    player: self.player.to_string(),
                })
            }
            Err(e) => {
                warn!("Heartbeat for {} failed: {}", self.player, e);
                Err(e)
            }
        }
    }

    /// Abandons the current session
    ///
    /// The lock is only released if the engine cannot have a changed
    /// inventory yet; otherwise it is left to expire. Returns true when the
    /// lock was left to expire.
    pub async fn abort(&mut self) -> bool {
        let state = self.state();
        if state == SyncState::Idle {
            return false;
        }

        info!("Aborting {} session in {:?}", self.player, state);
        self.set_state(SyncState::Aborting);
        let keep_lock = !state.before_apply();
        if !keep_lock {
            self.release().await;
        }
        self.session = None;
        keep_lock
    }
}
