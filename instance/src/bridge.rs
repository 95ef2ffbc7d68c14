//! Moving inventories in and out of the game engine
//!
//! The engine is reached through a remote console that accepts one command
//! string at a time and answers with one result string. [`RconBridge`] is the
//! operation level view the coordinator uses; [`CommandBridge`] implements it
//! on top of any [`CommandChannel`], and [`MemoryBridge`] stands in for an
//! engine in tests and the demo binary.
//!
//! Console commands are length limited, so payloads are cut with the shared
//! chunker and every chunk travels base64 encoded in its own command:
//!
//! ```text
//! inventory_sync apply <player> <index> <total> <digest> <base64>   -> ok
//! inventory_sync extract <player> <chunk_size>                       -> <total> <digest>
//! inventory_sync chunk <player> <index>                              -> <base64>
//! ```

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, warn};
use shared::chunker::{self, ChunkSet, Reassembly};
use shared::{Chunk, PlayerKey, Result, SyncError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[async_trait]
pub trait RconBridge: Send + Sync {
    /// Replaces the player's in-game inventory with `payload`
    async fn apply(&self, player: &PlayerKey, payload: &[u8], timeout: Duration) -> Result<()>;

    /// Reads the player's current in-game inventory
    async fn extract(&self, player: &PlayerKey, timeout: Duration) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn send_command(&self, command: &str) -> Result<String>;
}

async fn bounded<T>(
    what: &str,
    timeout: Duration,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| SyncError::BridgeUnavailable(format!("{} timed out after {:?}", what, timeout)))?
}

/// In-memory engine double
#[derive(Default)]
pub struct MemoryBridge {
    inventories: Mutex<HashMap<PlayerKey, Vec<u8>>>,
    failures: AtomicU32,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the player changing their inventory in game
    pub async fn set(&self, player: &PlayerKey, payload: Vec<u8>) {
        self.inventories.lock().await.insert(player.clone(), payload);
    }

    pub async fn get(&self, player: &PlayerKey) -> Option<Vec<u8>> {
        self.inventories.lock().await.get(player).cloned()
    }

    /// Makes the next `count` calls fail with [`SyncError::BridgeUnavailable`]
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::BridgeUnavailable("engine not responding".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RconBridge for MemoryBridge {
    async fn apply(&self, player: &PlayerKey, payload: &[u8], _timeout: Duration) -> Result<()> {
        self.check_available()?;
        self.set(player, payload.to_vec()).await;
        Ok(())
    }

    async fn extract(&self, player: &PlayerKey, _timeout: Duration) -> Result<Vec<u8>> {
        self.check_available()?;
        self.get(player).await.ok_or_else(|| {
            SyncError::BridgeUnavailable(format!("no inventory loaded for {}", player))
        })
    }
}

/// [`RconBridge`] speaking console commands over a [`CommandChannel`]
pub struct CommandBridge<C> {
    channel: C,
    chunk_size: usize,
}

impl<C: CommandChannel> CommandBridge<C> {
    pub fn new(channel: C, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(SyncError::InvalidChunkSize);
        }
        Ok(Self {
            channel,
            chunk_size,
        })
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    async fn apply_chunks(&self, player: &PlayerKey, payload: &[u8]) -> Result<()> {
        for chunk in chunker::transfer_frames(payload, self.chunk_size)? {
            let command = format!(
                "inventory_sync apply {} {} {} {} {}",
                player,
                chunk.index,
                chunk.total,
                chunk.digest,
                STANDARD.encode(&chunk.bytes)
            );
            let reply = self.channel.send_command(&command).await?;
            if reply.trim() != "ok" {
                return Err(SyncError::BridgeUnavailable(format!(
                    "apply of chunk {}/{} for {} failed: {}",
                    chunk.index, chunk.total, player, reply
                )));
            }
        }
        debug!("Applied {} bytes to {}", payload.len(), player);
        Ok(())
    }

    async fn extract_chunks(&self, player: &PlayerKey) -> Result<Vec<u8>> {
        let header = self
            .channel
            .send_command(&format!("inventory_sync extract {} {}", player, self.chunk_size))
            .await?;
        let (total, digest) = parse_header(&header)?;

        let mut set = ChunkSet::new(player.clone(), total, digest.clone());
        if total == 0 {
            let marker = Chunk {
                digest,
                ..Chunk::empty_marker()
            };
            return match set.insert(marker)? {
                Reassembly::Complete(payload) => Ok(payload),
                Reassembly::Incomplete { .. } => Err(set.incomplete_error()),
            };
        }

        for index in 0..total {
            let reply = self
                .channel
                .send_command(&format!("inventory_sync chunk {} {}", player, index))
                .await?;
            let bytes = STANDARD.decode(reply.trim()).map_err(|e| {
                SyncError::BridgeUnavailable(format!("chunk {} of {} is not base64: {}", index, player, e))
            })?;
            let chunk = Chunk {
                index,
                total,
                digest: digest.clone(),
                bytes,
            };
            if let Reassembly::Complete(payload) = set.insert(chunk)? {
                return Ok(payload);
            }
        }
        Err(set.incomplete_error())
    }
}

fn parse_header(header: &str) -> Result<(u32, String)> {
    let mut parts = header.split_whitespace();
    match (parts.next().map(str::parse::<u32>), parts.next(), parts.next()) {
        (Some(Ok(total)), Some(digest), None) => Ok((total, digest.to_string())),
        _ => Err(SyncError::BridgeUnavailable(format!(
            "unexpected extract header {:?}",
            header
        ))),
    }
}

#[async_trait]
impl<C: CommandChannel> RconBridge for CommandBridge<C> {
    async fn apply(&self, player: &PlayerKey, payload: &[u8], timeout: Duration) -> Result<()> {
        bounded("apply", timeout, self.apply_chunks(player, payload)).await
    }

    async fn extract(&self, player: &PlayerKey, timeout: Duration) -> Result<Vec<u8>> {
        let result = bounded("extract", timeout, self.extract_chunks(player)).await;
        if let Err(SyncError::IntegrityMismatch { .. }) = &result {
            warn!("Inventory of {} changed while it was being extracted", player);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Engine side of the console protocol, backed by a map
    #[derive(Default)]
    struct FakeEngine {
        inventories: StdMutex<HashMap<String, Vec<u8>>>,
        incoming: StdMutex<HashMap<String, ChunkSet>>,
        commands: AtomicU32,
        hang: bool,
    }

    impl FakeEngine {
        fn handle(&self, command: &str) -> String {
            let parts: Vec<&str> = command.split(' ').collect();
            match parts.as_slice() {
                ["inventory_sync", "apply", player, index, total, digest, data] => {
                    let key = PlayerKey::new(player).unwrap();
                    let chunk = Chunk {
                        index: index.parse().unwrap(),
                        total: total.parse().unwrap(),
                        digest: digest.to_string(),
                        bytes: STANDARD.decode(data).unwrap(),
                    };
                    let mut incoming = self.incoming.lock().unwrap();
                    let set = incoming
                        .entry(player.to_string())
                        .or_insert_with(|| ChunkSet::from_chunk(key, &chunk));
                    match set.insert(chunk) {
                        Ok(Reassembly::Complete(payload)) => {
                            incoming.remove(*player);
                            self.inventories
                                .lock()
                                .unwrap()
                                .insert(player.to_string(), payload);
                            "ok".to_string()
                        }
                        Ok(Reassembly::Incomplete { .. }) => "ok".to_string(),
                        Err(e) => e.to_string(),
                    }
                }
                ["inventory_sync", "extract", player, size] => {
                    let inventories = self.inventories.lock().unwrap();
                    let payload = inventories.get(*player).cloned().unwrap_or_default();
                    let chunks = chunker::split(&payload, size.parse().unwrap()).unwrap();
                    format!("{} {}", chunks.len(), chunker::payload_digest(&payload))
                }
                ["inventory_sync", "chunk", player, index] => {
                    let inventories = self.inventories.lock().unwrap();
                    let payload = inventories.get(*player).cloned().unwrap_or_default();
                    let index: usize = index.parse().unwrap();
                    let chunk = payload.chunks(4).nth(index).unwrap_or_default();
                    STANDARD.encode(chunk)
                }
                _ => "unknown command".to_string(),
            }
        }
    }

    #[async_trait]
    impl CommandChannel for FakeEngine {
        async fn send_command(&self, command: &str) -> Result<String> {
            self.commands.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(self.handle(command))
        }
    }

    fn dave() -> PlayerKey {
        PlayerKey::new("dave").unwrap()
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_command_bridge_round_trip() {
        let bridge = CommandBridge::new(FakeEngine::default(), 4).unwrap();
        let payload = b"iron-plate:100;copper-plate:50".to_vec();

        bridge.apply(&dave(), &payload, TIMEOUT).await.unwrap();
        // 30 bytes in chunks of 4
        assert_eq!(bridge.channel().commands.load(Ordering::SeqCst), 8);

        let extracted = bridge.extract(&dave(), TIMEOUT).await.unwrap();
        assert_eq!(extracted, payload);
    }

    #[tokio::test]
    async fn test_command_bridge_empty_inventory() {
        let bridge = CommandBridge::new(FakeEngine::default(), 4).unwrap();

        bridge.apply(&dave(), &[], TIMEOUT).await.unwrap();
        assert_eq!(bridge.extract(&dave(), TIMEOUT).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_command_bridge_times_out() {
        let engine = FakeEngine {
            hang: true,
            ..FakeEngine::default()
        };
        let bridge = CommandBridge::new(engine, 4).unwrap();

        let result = bridge.apply(&dave(), b"abc", Duration::from_millis(20)).await;
        assert!(matches!(result, Err(SyncError::BridgeUnavailable(_))));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            CommandBridge::new(FakeEngine::default(), 0),
            Err(SyncError::InvalidChunkSize)
        ));
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_header("3 abc\n").unwrap(), (3, "abc".to_string()));
        assert!(parse_header("three abc").is_err());
        assert!(parse_header("3").is_err());
    }

    #[tokio::test]
    async fn test_memory_bridge_failures() {
        let bridge = MemoryBridge::new();
        bridge.fail_next(1);

        assert!(bridge.apply(&dave(), b"x", TIMEOUT).await.is_err());
        bridge.apply(&dave(), b"x", TIMEOUT).await.unwrap();
        assert_eq!(bridge.extract(&dave(), TIMEOUT).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_memory_bridge_extract_without_inventory() {
        let bridge = MemoryBridge::new();
        assert!(matches!(
            bridge.extract(&dave(), TIMEOUT).await,
            Err(SyncError::BridgeUnavailable(_))
        ));
    }
}
