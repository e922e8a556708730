//! RocksDB-backed [`LogStore`] (feature `rocksdb`).
//!
//! Column families:
//! - `ops`         — sequenced operations, key `<doc:16><seq:8 BE>`
//! - `checkpoints` — LZ4 checkpoints, key `<doc:16>`
//!
//! Big-endian sequence keys keep each document's operations contiguous and
//! ordered, so a cursor read is one forward iterator.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::PathBuf;

use super::{Checkpoint, LogStore, StoreError};
use crate::protocol::{DocumentId, SequencedOp};

const CF_OPS: &str = "ops";
const CF_CHECKPOINTS: &str = "checkpoints";
const COLUMN_FAMILIES: &[&str] = &[CF_OPS, CF_CHECKPOINTS];

#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes. Default: 64MB.
    pub block_cache_size: usize,
    /// fsync on every write. Default: false.
    pub sync_writes: bool,
}

impl Default for RocksStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hwt_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

impl RocksStoreConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksLogStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksStoreConfig,
}

impl RocksLogStore {
    pub fn open(config: RocksStoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut block_opts = BlockBasedOptions::default();
                block_opts.set_block_cache(&cache);
                let mut opts = Options::default();
                opts.set_block_based_table_factory(&block_opts);
                // Checkpoints are LZ4 already.
                opts.set_compression_type(match *name {
                    CF_OPS => DBCompressionType::Lz4,
                    _ => DBCompressionType::None,
                });
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;
        log::info!("Opened RocksDB log store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn op_key(doc_id: DocumentId, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_uuid().as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl LogStore for RocksLogStore {
    fn append(&mut self, doc_id: DocumentId, entry: &SequencedOp) -> Result<(), StoreError> {
        let head = self.head(doc_id)?;
        if entry.seq <= head {
            return Err(StoreError::OutOfOrder { doc_id, seq: entry.seq, head });
        }
        let value = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        let cf = self.cf(CF_OPS)?;
        self.db
            .put_cf_opt(cf, Self::op_key(doc_id, entry.seq), value, &self.write_opts())?;
        Ok(())
    }

    fn read_from(
        &self,
        doc_id: DocumentId,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<SequencedOp>, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let Some(first) = cursor.checked_add(1) else {
            return Ok(Vec::new());
        };
        let start = Self::op_key(doc_id, first);
        let prefix = doc_id.as_uuid();

        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != prefix.as_bytes() {
                break;
            }
            let (entry, _) = bincode::serde::decode_from_slice(&value, bincode::config::standard())
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            out.push(entry);
        }
        Ok(out)
    }

    fn head(&self, doc_id: DocumentId) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let end = Self::op_key(doc_id, u64::MAX);
        let mut iter = self.db.iterator_cf(cf, IteratorMode::From(&end, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.len() == 24 && &key[..16] == doc_id.as_uuid().as_bytes() {
                    let mut seq = [0u8; 8];
                    seq.copy_from_slice(&key[16..]);
                    Ok(u64::from_be_bytes(seq))
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    fn save_checkpoint(&mut self, doc_id: DocumentId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        self.db.put_cf_opt(
            cf,
            doc_id.as_uuid().as_bytes(),
            checkpoint.encode()?,
            &self.write_opts(),
        )?;
        Ok(())
    }

    fn load_checkpoint(&self, doc_id: DocumentId) -> Result<Option<Checkpoint>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        self.db
            .get_cf(cf, doc_id.as_uuid().as_bytes())?
            .map(|bytes| Checkpoint::decode(&bytes))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{LamportTimestamp, SiteId};
    use crate::element::ElementId;
    use crate::operation::{OpKind, Operation};
    use crate::replica::Snapshot;

    fn entry(seq: u64) -> SequencedOp {
        let op = Operation::new(
            LamportTimestamp::new(seq, SiteId::from_u128(1)),
            ElementId::from_u128(1),
            OpKind::Delete,
            vec![],
        );
        SequencedOp { seq, op }
    }

    #[test]
    fn test_documents_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksLogStore::open(RocksStoreConfig::for_testing(dir.path())).unwrap();
        let (a, b) = (DocumentId::from_u128(1), DocumentId::from_u128(2));

        for seq in 1..=4 {
            store.append(a, &entry(seq)).unwrap();
        }
        store.append(b, &entry(1)).unwrap();

        assert_eq!(store.head(a).unwrap(), 4);
        assert_eq!(store.head(b).unwrap(), 1);
        assert_eq!(store.head(DocumentId::from_u128(3)).unwrap(), 0);
        assert_eq!(store.read_from(a, 2, 10).unwrap(), vec![entry(3), entry(4)]);
        assert_eq!(store.read_from(b, 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksLogStore::open(RocksStoreConfig::for_testing(dir.path())).unwrap();
        let doc = DocumentId::from_u128(1);
        let checkpoint = Checkpoint { seq: 9, snapshot: Snapshot::empty() };

        store.save_checkpoint(doc, &checkpoint).unwrap();
        assert_eq!(store.load_checkpoint(doc).unwrap(), Some(checkpoint));
    }
}
