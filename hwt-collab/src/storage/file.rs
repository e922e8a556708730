//! File-backed [`LogStore`]: one append-only frame file per document.
//!
//! Frame layout:
//! ```text
//! ┌──────────┬──────────┬──────────────────────────┐
//! │ len u32  │ fnv u32  │ bincode(SequencedOp)     │
//! │ LE       │ LE       │ len bytes                │
//! └──────────┴──────────┴──────────────────────────┘
//! ```
//!
//! Recovery replays frames until the first short or corrupt one and
//! truncates the file there, so a crash mid-append loses at most the frame
//! being written. Checkpoints live next to the log as `<doc>.ckpt`,
//! replaced atomically through a rename.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{Checkpoint, LogStore, StoreError};
use crate::protocol::{DocumentId, SequencedOp};

const FRAME_HEADER: usize = 8;
const LOG_EXT: &str = "log";
const CHECKPOINT_EXT: &str = "ckpt";

#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Directory holding `<doc>.log` and `<doc>.ckpt` files.
    pub dir: PathBuf,
    /// fsync after every append. Default: false.
    pub sync_writes: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("hwt_data"),
            sync_writes: false,
        }
    }
}

impl FileStoreConfig {
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync_writes: false,
        }
    }
}

struct DocLog {
    file: File,
    entries: Vec<SequencedOp>,
}

pub struct FileLogStore {
    config: FileStoreConfig,
    docs: HashMap<DocumentId, DocLog>,
}

impl FileLogStore {
    /// Open the directory, recovering every document log found in it.
    pub fn open(config: FileStoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.dir)?;
        let mut docs = HashMap::new();

        for dir_entry in fs::read_dir(&config.dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXT) {
                continue;
            }
            let Some(doc_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(DocumentId::from)
            else {
                log::warn!("Skipping unrecognised log file {}", path.display());
                continue;
            };

            let entries = recover(&path)?;
            let file = OpenOptions::new().append(true).open(&path)?;
            log::info!("Recovered {} operations for {doc_id}", entries.len());
            docs.insert(doc_id, DocLog { file, entries });
        }

        Ok(Self { config, docs })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn log_path(&self, doc_id: DocumentId) -> PathBuf {
        self.config.dir.join(format!("{doc_id}.{LOG_EXT}"))
    }

    fn checkpoint_path(&self, doc_id: DocumentId) -> PathBuf {
        self.config.dir.join(format!("{doc_id}.{CHECKPOINT_EXT}"))
    }

    fn doc_log(&mut self, doc_id: DocumentId) -> Result<&mut DocLog, StoreError> {
        if !self.docs.contains_key(&doc_id) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path(doc_id))?;
            self.docs.insert(doc_id, DocLog { file, entries: Vec::new() });
        }
        self.docs
            .get_mut(&doc_id)
            .ok_or_else(|| StoreError::Database(format!("log for {doc_id} vanished")))
    }
}

impl LogStore for FileLogStore {
    fn append(&mut self, doc_id: DocumentId, entry: &SequencedOp) -> Result<(), StoreError> {
        let sync = self.config.sync_writes;
        let log = self.doc_log(doc_id)?;
        let head = log.entries.last().map_or(0, |e| e.seq);
        if entry.seq <= head {
            return Err(StoreError::OutOfOrder { doc_id, seq: entry.seq, head });
        }

        let payload = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        log.file.write_all(&frame)?;
        if sync {
            log.file.sync_data()?;
        }
        log.entries.push(entry.clone());
        Ok(())
    }

    fn read_from(
        &self,
        doc_id: DocumentId,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<SequencedOp>, StoreError> {
        let Some(log) = self.docs.get(&doc_id) else {
            return Ok(Vec::new());
        };
        let start = log.entries.partition_point(|e| e.seq <= cursor);
        Ok(log.entries[start..].iter().take(limit).cloned().collect())
    }

    fn head(&self, doc_id: DocumentId) -> Result<u64, StoreError> {
        Ok(self
            .docs
            .get(&doc_id)
            .and_then(|log| log.entries.last())
            .map_or(0, |e| e.seq))
    }

    fn save_checkpoint(&mut self, doc_id: DocumentId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let bytes = checkpoint.encode()?;
        let path = self.checkpoint_path(doc_id);
        let tmp = path.with_extension(format!("{CHECKPOINT_EXT}.tmp"));

        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        log::debug!("Checkpoint for {doc_id} at seq {} ({} bytes)", checkpoint.seq, bytes.len());
        Ok(())
    }

    fn load_checkpoint(&self, doc_id: DocumentId) -> Result<Option<Checkpoint>, StoreError> {
        let path = self.checkpoint_path(doc_id);
        match fs::read(&path) {
            Ok(bytes) => Checkpoint::decode(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read every intact frame, truncating a torn or corrupt tail.
fn recover(path: &Path) -> Result<Vec<SequencedOp>, StoreError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset + FRAME_HEADER <= bytes.len() {
        let len = u32::from_le_bytes(word(&bytes[offset..offset + 4])) as usize;
        let sum = u32::from_le_bytes(word(&bytes[offset + 4..offset + 8]));
        let start = offset + FRAME_HEADER;
        let Some(payload) = bytes.get(start..start + len) else {
            break;
        };
        if checksum(payload) != sum {
            break;
        }
        match bincode::serde::decode_from_slice::<SequencedOp, _>(payload, bincode::config::standard()) {
            Ok((entry, _)) => entries.push(entry),
            Err(_) => break,
        }
        offset = start + len;
    }

    if offset < bytes.len() {
        log::warn!(
            "Truncating {} trailing bytes of {}",
            bytes.len() - offset,
            path.display()
        );
        OpenOptions::new().write(true).open(path)?.set_len(offset as u64)?;
    }
    Ok(entries)
}

fn word(bytes: &[u8]) -> [u8; 4] {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    buf
}

/// FNV-1a over the payload.
fn checksum(payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in payload {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
