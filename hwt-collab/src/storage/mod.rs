//! Durable operation log for the relay.
//!
//! ```text
//! ┌──────────────┐  append(seq, op)   ┌────────────────────────────┐
//! │ RelaySession │ ─────────────────► │ LogStore                   │
//! │ (in memory)  │  save_checkpoint   │  ops:        doc → [seq]   │
//! └──────┬───────┘ ─────────────────► │  checkpoint: doc → LZ4     │
//!        │ on first join              └────────────────────────────┘
//!        ▼
//!  load_checkpoint + read_from(checkpoint.seq)
//! ```
//!
//! The engine needs only append and range-read-by-cursor; the on-disk format
//! belongs to each implementation.

pub mod file;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::protocol::{DocumentId, SequencedOp};
use crate::replica::Snapshot;

pub use file::{FileLogStore, FileStoreConfig};
pub use memory::MemoryLogStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksLogStore, RocksStoreConfig};

/// Snapshot of a document plus the relay sequence it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u64,
    pub snapshot: Snapshot,
}

impl Checkpoint {
    /// bincode, then LZ4 with the uncompressed size prepended.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (checkpoint, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(checkpoint)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Encode(String),
    #[error("deserialization error: {0}")]
    Decode(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("sequence {seq} for {doc_id} is not after head {head}")]
    OutOfOrder { doc_id: DocumentId, seq: u64, head: u64 },
}

/// Append-only operation log with range reads by relay cursor.
pub trait LogStore: Send {
    /// Persist one sequenced operation. Sequences must increase per document.
    fn append(&mut self, doc_id: DocumentId, entry: &SequencedOp) -> Result<(), StoreError>;

    /// Up to `limit` operations with `seq > cursor`, oldest first.
    fn read_from(
        &self,
        doc_id: DocumentId,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<SequencedOp>, StoreError>;

    /// Highest stored sequence, 0 for an unknown document.
    fn head(&self, doc_id: DocumentId) -> Result<u64, StoreError>;

    fn save_checkpoint(&mut self, doc_id: DocumentId, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    fn load_checkpoint(&self, doc_id: DocumentId) -> Result<Option<Checkpoint>, StoreError>;
}

/// A store shared by every relay session.
pub type SharedStore = Arc<Mutex<Box<dyn LogStore>>>;

pub fn shared(store: impl LogStore + 'static) -> SharedStore {
    Arc::new(Mutex::new(Box::new(store)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SiteId;
    use crate::config::EngineConfig;
    use crate::element::FieldValue;
    use crate::replica::DocumentReplica;

    #[test]
    fn test_checkpoint_compresses() {
        let mut replica = DocumentReplica::new(SiteId::from_u128(1), EngineConfig::default());
        for i in 0..200 {
            replica
                .insert([("value", FieldValue::text("10k")), ("index", FieldValue::Int(i))])
                .unwrap();
        }
        let checkpoint = Checkpoint { seq: 200, snapshot: replica.snapshot() };
        let raw_len = bincode::serde::encode_to_vec(&checkpoint, bincode::config::standard())
            .unwrap()
            .len();
        let encoded = checkpoint.encode().unwrap();

        assert!(encoded.len() < raw_len);
        assert_eq!(Checkpoint::decode(&encoded).unwrap(), checkpoint);
    }

    #[test]
    fn test_checkpoint_decode_garbage() {
        assert!(Checkpoint::decode(&[1, 2, 3]).is_err());
    }
}
