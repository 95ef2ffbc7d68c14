//! Canonical inventory records and their on-disk form
//!
//! The store maps each player to the last inventory uploaded for them. Writes
//! are only accepted from the instance the lock registry currently names as
//! holder, and every accepted write bumps the record version by one.
//!
//! Records are persisted as a JSON array with base64 payloads. Saving writes
//! a sibling `.tmp` file first and renames it over the database so a crash
//! mid-save never leaves a truncated file behind.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use shared::{DatabaseStats, InstanceId, PlayerKey, Result, SyncError};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Authoritative copy of one player's inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub player: PlayerKey,
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
    /// Starts at 1 with the first accepted upload
    pub version: u64,
    pub last_writer: InstanceId,
    pub updated_at_ms: u64,
}

pub struct DatabaseStore {
    records: HashMap<PlayerKey, InventoryRecord>,
    path: Option<PathBuf>,
    dirty: bool,
}

impl DatabaseStore {
    /// Creates a store that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            records: HashMap::new(),
            path: None,
            dirty: false,
        }
    }

    /// Opens the database at `path`, starting empty if the file does not exist yet
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self {
            records: HashMap::new(),
            path: Some(path.clone()),
            dirty: false,
        };

        if !path.exists() {
            info!("No inventory database at {}, starting empty", path.display());
            return Ok(store);
        }

        let contents = fs::read(&path)
            .map_err(|e| SyncError::Storage(format!("reading {}: {}", path.display(), e)))?;
        let records: Vec<InventoryRecord> = serde_json::from_slice(&contents)
            .map_err(|e| SyncError::Storage(format!("parsing {}: {}", path.display(), e)))?;

        for record in records {
            store.records.insert(record.player.clone(), record);
        }
        info!(
            "Loaded {} inventories from {}",
            store.records.len(),
            path.display()
        );
        Ok(store)
    }

    /// Writes every record to disk if anything changed since the last save
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        let mut records: Vec<&InventoryRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.player.cmp(&b.player));
        let contents = serde_json::to_vec_pretty(&records)
            .map_err(|e| SyncError::Storage(format!("serializing database: {}", e)))?;

        if let Err(e) = write_replacing(&path, &contents) {
            error!("Failed to save inventory database: {}", e);
            return Err(e);
        }

        self.dirty = false;
        info!("Saved {} inventories to {}", records.len(), path.display());
        Ok(())
    }

    pub fn get(&self, player: &PlayerKey) -> Option<&InventoryRecord> {
        self.records.get(player)
    }

    /// Commits a new payload for `player`
    ///
    /// `current_holder` must come from the lock registry at the moment of the
    /// commit; the write is rejected unless it names `writer`. When
    /// `base_version` is given it must equal the stored version, which stops
    /// an instance that lost and later re-won the lock from overwriting data
    /// written by someone else in between.
    pub fn put(
        &mut self,
        player: &PlayerKey,
        payload: Vec<u8>,
        writer: &InstanceId,
        current_holder: Option<&InstanceId>,
        base_version: Option<u64>,
        now_ms: u64,
    ) -> Result<u64> {
        if current_holder != Some(writer) {
            warn!(
                "Rejected upload of {} from {}: lock held by {}",
                player,
                writer,
                current_holder.map_or("nobody".to_string(), |h| h.to_string())
            );
            return Err(SyncError::TransferRejected {
                player: player.to_string(),
                reason: shared::NOT_HOLDER.to_string(),
            });
        }

        let stored_version = self.records.get(player).map_or(0, |r| r.version);
        if let Some(base) = base_version {
            if base != stored_version {
                warn!(
                    "Rejected upload of {} from {}: based on version {} but stored is {}",
                    player, writer, base, stored_version
                );
                return Err(SyncError::TransferRejected {
                    player: player.to_string(),
                    reason: format!("stale-version: expected {}, found {}", base, stored_version),
                });
            }
        }

        let version = stored_version + 1;
        self.records.insert(
            player.clone(),
            InventoryRecord {
                player: player.clone(),
                payload,
                version,
                last_writer: writer.clone(),
                updated_at_ms: now_ms,
            },
        );
        self.dirty = true;
        Ok(version)
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            record_count: self.records.len() as u64,
            total_bytes: self.records.values().map(|r| r.payload.len() as u64).sum(),
            ..DatabaseStats::default()
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Writes `contents` next to `path` and renames it into place.
fn write_replacing(path: &Path, contents: &[u8]) -> Result<()> {
    let mut temporary = path.as_os_str().to_owned();
    temporary.push(".tmp");
    let temporary = PathBuf::from(temporary);

    let storage_err = |e: std::io::Error| SyncError::Storage(format!("{}: {}", path.display(), e));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(storage_err)?;
    }

    let mut file = fs::File::create(&temporary).map_err(storage_err)?;
    file.write_all(contents).map_err(storage_err)?;
    file.sync_all().map_err(storage_err)?;
    fs::rename(&temporary, path).map_err(storage_err)?;
    Ok(())
}

mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
