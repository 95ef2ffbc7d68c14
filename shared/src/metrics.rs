//! Counters describing lock and transfer activity.
//!
//! A [`SyncMetrics`] is created once by a binary and handed to every
//! component that reports something; nothing here is global.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SyncMetrics {
    locks_granted: AtomicU64,
    locks_denied: AtomicU64,
    locks_released: AtomicU64,
    locks_expired: AtomicU64,
    uploads_committed: AtomicU64,
    uploads_rejected: AtomicU64,
    transfers_abandoned: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub locks_granted: u64,
    pub locks_denied: u64,
    pub locks_released: u64,
    pub locks_expired: u64,
    pub uploads_committed: u64,
    pub uploads_rejected: u64,
    pub transfers_abandoned: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_granted(&self) {
        self.locks_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_denied(&self) {
        self.locks_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_released(&self) {
        self.locks_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn locks_expired(&self, count: usize) {
        self.locks_expired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn upload_committed(&self, bytes: usize) {
        self.uploads_committed.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn upload_rejected(&self) {
        self.uploads_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_abandoned(&self) {
        self.transfers_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn downloaded(&self, bytes: usize) {
        self.bytes_downloaded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            locks_granted: self.locks_granted.load(Ordering::Relaxed),
            locks_denied: self.locks_denied.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            locks_expired: self.locks_expired.load(Ordering::Relaxed),
            uploads_committed: self.uploads_committed.load(Ordering::Relaxed),
            uploads_rejected: self.uploads_rejected.load(Ordering::Relaxed),
            transfers_abandoned: self.transfers_abandoned.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}
