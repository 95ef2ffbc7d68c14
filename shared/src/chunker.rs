//! Splitting opaque payloads into bounded chunks and putting them back together.
//!
//! Both the controller transfers and the command bridge into the game engine
//! push payloads through narrow pipes, so everything larger than one chunk is
//! cut into `{index, total, bytes}` pieces. The receiving side collects them in
//! a [`ChunkSet`] which tolerates duplicates and arbitrary arrival order and
//! only reports completion once every index has been seen.

use crate::error::{Result, SyncError};
use crate::PlayerKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Chunk size used unless configured otherwise. A chunk this size, wrapped
/// in a packet, stays well inside one UDP datagram.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// One bounded fragment of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of this fragment, `0..total`
    pub index: u32,
    /// Number of fragments in the whole transfer
    pub total: u32,
    /// Hex SHA-256 of the complete payload, repeated on every chunk
    pub digest: String,
    pub bytes: Vec<u8>,
}

impl Chunk {
    /// Marker sent in place of chunks when the payload is empty.
    pub fn empty_marker() -> Self {
        Self {
            index: 0,
            total: 0,
            digest: payload_digest(&[]),
            bytes: Vec::new(),
        }
    }

    pub fn is_last(&self) -> bool {
        self.total == 0 || self.index.checked_add(1) == Some(self.total)
    }

    /// Whether `index` lies inside `0..total`, or is the empty marker.
    pub fn in_range(&self) -> bool {
        if self.total == 0 {
            self.index == 0
        } else {
            self.index < self.total
        }
    }
}

/// Hex encoded SHA-256 of a payload.
pub fn payload_digest(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Splits `payload` into ordered chunks of at most `chunk_size` bytes.
///
/// An empty payload produces no chunks at all.
pub fn split(payload: &[u8], chunk_size: usize) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(SyncError::InvalidChunkSize);
    }

    let digest = payload_digest(payload);
    let total = payload.len().div_ceil(chunk_size) as u32;

    Ok(payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, bytes)| Chunk {
            index: index as u32,
            total,
            digest: digest.clone(),
            bytes: bytes.to_vec(),
        })
        .collect())
}

/// Chunks as they go over the wire: identical to [`split`] except that an
/// empty payload is announced with a single [`Chunk::empty_marker`].
pub fn transfer_frames(payload: &[u8], chunk_size: usize) -> Result<Vec<Chunk>> {
    let chunks = split(payload, chunk_size)?;
    if chunks.is_empty() {
        Ok(vec![Chunk::empty_marker()])
    } else {
        Ok(chunks)
    }
}

/// Progress of a reassembly after inserting a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    Incomplete { received: u32, total: u32 },
    Complete(Vec<u8>),
}

/// Receiving side state for a single transfer.
#[derive(Debug)]
pub struct ChunkSet {
    pub player: PlayerKey,
    pub total: u32,
    pub digest: String,
    received: BTreeMap<u32, Vec<u8>>,
    pub started_at: Instant,
}

impl ChunkSet {
    pub fn new(player: PlayerKey, total: u32, digest: String) -> Self {
        Self {
            player,
            total,
            digest,
            received: BTreeMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Starts a set from whichever chunk of the transfer happened to arrive first.
    pub fn from_chunk(player: PlayerKey, chunk: &Chunk) -> Self {
        Self::new(player, chunk.total, chunk.digest.clone())
    }

    /// Records a chunk and reports whether the payload is now complete.
    ///
    /// Re-inserting an index overwrites it, so retransmissions are harmless.
    /// Once complete, further inserts keep returning the same payload.
    pub fn insert(&mut self, chunk: Chunk) -> Result<Reassembly> {
        if chunk.total != self.total || chunk.digest != self.digest {
            return Err(SyncError::ChunkMismatch(format!(
                "chunk {}/{} for {} does not match transfer of {} chunks",
                chunk.index, chunk.total, self.player, self.total
            )));
        }

        if !chunk.in_range() {
            return Err(SyncError::ChunkMismatch(format!(
                "chunk index {} out of range 0..{}",
                chunk.index, self.total
            )));
        }
        if self.total > 0 {
            self.received.insert(chunk.index, chunk.bytes);
        }

        if !self.is_complete() {
            return Ok(Reassembly::Incomplete {
                received: self.received_count(),
                total: self.total,
            });
        }

        let payload = self.assemble();
        let actual = payload_digest(&payload);
        if actual != self.digest {
            return Err(SyncError::IntegrityMismatch {
                expected: self.digest.clone(),
                actual,
            });
        }

        Ok(Reassembly::Complete(payload))
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.total
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.started_at.elapsed() > timeout
    }

    /// The error reported when this set is abandoned before completion.
    pub fn incomplete_error(&self) -> SyncError {
        SyncError::TransferIncomplete {
            player: self.player.to_string(),
            received: self.received_count(),
            total: self.total,
        }
    }

    // BTreeMap iterates in key order, never arrival order.
    fn assemble(&self) -> Vec<u8> {
        let len = self.received.values().map(Vec::len).sum();
        let mut payload = Vec::with_capacity(len);
        for bytes in self.received.values() {
            payload.extend_from_slice(bytes);
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn bob() -> PlayerKey {
        PlayerKey::new("Bob").unwrap()
    }

    fn reassemble(chunks: Vec<Chunk>) -> Vec<u8> {
        let mut set = ChunkSet::from_chunk(bob(), &chunks[0]);
        let mut result = None;
        for chunk in chunks {
            if let Reassembly::Complete(payload) = set.insert(chunk).unwrap() {
                result = Some(payload);
            }
        }
        result.expect("transfer never completed")
    }

    #[test]
    fn test_split_sizes() {
        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let chunks = split(&payload, 1000).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].bytes.len(), 1000);
        assert_eq!(chunks[1].bytes.len(), 1000);
        assert_eq!(chunks[2].bytes.len(), 500);
        assert!(chunks.iter().all(|c| c.total == 3));
        assert!(chunks[2].is_last());
        assert!(!chunks[0].is_last());
    }

    #[test]
    fn test_split_empty_payload() {
        assert!(split(&[], 1000).unwrap().is_empty());

        let frames = transfer_frames(&[], 1000).unwrap();
        assert_eq!(frames, vec![Chunk::empty_marker()]);
        assert!(frames[0].is_last());
    }

    #[test]
    fn test_split_rejects_zero_chunk_size() {
        assert_eq!(split(b"abc", 0), Err(SyncError::InvalidChunkSize));
    }

    #[test]
    fn test_single_short_chunk() {
        let chunks = split(b"tiny", 1000).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(reassemble(chunks), b"tiny");
    }

    #[test]
    fn test_empty_marker_completes_immediately() {
        let marker = Chunk::empty_marker();
        let mut set = ChunkSet::from_chunk(bob(), &marker);
        assert_eq!(set.insert(marker).unwrap(), Reassembly::Complete(Vec::new()));
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 13) as u8).collect();
        let mut chunks = split(&payload, 1000).unwrap();
        chunks.reverse();
        assert_eq!(reassemble(chunks), payload);
    }

    #[test]
    fn test_duplicate_before_first_chunk() {
        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 7) as u8).collect();
        let chunks = split(&payload, 1000).unwrap();

        let mut set = ChunkSet::from_chunk(bob(), &chunks[1]);
        assert_eq!(
            set.insert(chunks[1].clone()).unwrap(),
            Reassembly::Incomplete {
                received: 1,
                total: 3
            }
        );
        assert_eq!(
            set.insert(chunks[1].clone()).unwrap(),
            Reassembly::Incomplete {
                received: 1,
                total: 3
            }
        );
        set.insert(chunks[0].clone()).unwrap();

        match set.insert(chunks[2].clone()).unwrap() {
            Reassembly::Complete(result) => assert_eq!(result, payload),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_random_permutations_with_repeats() {
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let len = rng.gen_range(0..5000);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let chunk_size = rng.gen_range(1..700);

            let mut frames = transfer_frames(&payload, chunk_size).unwrap();
            let repeats: Vec<Chunk> = frames
                .iter()
                .filter(|_| rng.gen_bool(0.3))
                .cloned()
                .collect();
            frames.extend(repeats);
            frames.shuffle(&mut rng);

            assert_eq!(reassemble(frames), payload);
        }
    }

    #[test]
    fn test_rejects_foreign_chunk() {
        let first = split(b"first payload", 4).unwrap();
        let second = split(b"second payload", 4).unwrap();

        let mut set = ChunkSet::from_chunk(bob(), &first[0]);
        assert!(matches!(
            set.insert(second[0].clone()),
            Err(SyncError::ChunkMismatch(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_index() {
        let mut chunks = split(b"abcdef", 3).unwrap();
        let mut bogus = chunks.remove(0);
        bogus.index = 7;

        let mut set = ChunkSet::from_chunk(bob(), &bogus);
        assert!(matches!(set.insert(bogus), Err(SyncError::ChunkMismatch(_))));
    }

    #[test]
    fn test_maximum_index_is_not_last() {
        let mut chunk = split(b"abcdef", 3).unwrap().remove(1);
        assert!(chunk.is_last());

        chunk.index = u32::MAX;
        assert!(!chunk.is_last());
        assert!(!chunk.in_range());

        let mut set = ChunkSet::from_chunk(bob(), &chunk);
        assert!(matches!(set.insert(chunk), Err(SyncError::ChunkMismatch(_))));
    }

    #[test]
    fn test_detects_corrupted_bytes() {
        let mut chunks = split(b"abcdef", 3).unwrap();
        chunks[1].bytes = b"xyz".to_vec();

        let mut set = ChunkSet::from_chunk(bob(), &chunks[0]);
        set.insert(chunks[0].clone()).unwrap();
        assert!(matches!(
            set.insert(chunks[1].clone()),
            Err(SyncError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_incomplete_set_expires() {
        let chunks = split(b"abcdef", 2).unwrap();
        let mut set = ChunkSet::from_chunk(bob(), &chunks[0]);
        set.insert(chunks[0].clone()).unwrap();

        assert!(!set.is_expired(Duration::from_secs(30)));
        set.started_at = Instant::now() - Duration::from_secs(31);
        assert!(set.is_expired(Duration::from_secs(30)));

        assert_eq!(
            set.incomplete_error(),
            SyncError::TransferIncomplete {
                player: "bob".into(),
                received: 1,
                total: 3
            }
        );
    }
}
