//! In-memory [`LogStore`], for tests and ephemeral relays.

use std::collections::HashMap;

use super::{Checkpoint, LogStore, StoreError};
use crate::protocol::{DocumentId, SequencedOp};

#[derive(Default)]
pub struct MemoryLogStore {
    ops: HashMap<DocumentId, Vec<SequencedOp>>,
    /// Encoded like on disk so the codec is exercised.
    checkpoints: HashMap<DocumentId, Vec<u8>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn append(&mut self, doc_id: DocumentId, entry: &SequencedOp) -> Result<(), StoreError> {
        let ops = self.ops.entry(doc_id).or_default();
        let head = ops.last().map_or(0, |e| e.seq);
        if entry.seq <= head {
            return Err(StoreError::OutOfOrder { doc_id, seq: entry.seq, head });
        }
        ops.push(entry.clone());
        Ok(())
    }

    fn read_from(
        &self,
        doc_id: DocumentId,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<SequencedOp>, StoreError> {
        let Some(ops) = self.ops.get(&doc_id) else {
            return Ok(Vec::new());
        };
        let start = ops.partition_point(|e| e.seq <= cursor);
        Ok(ops[start..].iter().take(limit).cloned().collect())
    }

    fn head(&self, doc_id: DocumentId) -> Result<u64, StoreError> {
        Ok(self
            .ops
            .get(&doc_id)
            .and_then(|ops| ops.last())
            .map_or(0, |e| e.seq))
    }

    fn save_checkpoint(&mut self, doc_id: DocumentId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.checkpoints.insert(doc_id, checkpoint.encode()?);
        Ok(())
    }

    fn load_checkpoint(&self, doc_id: DocumentId) -> Result<Option<Checkpoint>, StoreError> {
        self.checkpoints
            .get(&doc_id)
            .map(|bytes| Checkpoint::decode(bytes))
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
            OpKind::update("n", seq as i64),
            vec![],
        );
        SequencedOp { seq, op }
    }

    #[test]
    fn test_read_from_cursor() {
        let doc = DocumentId::from_u128(1);
        let mut store = MemoryLogStore::new();
        for seq in 1..=10 {
            store.append(doc, &entry(seq)).unwrap();
        }

        let tail = store.read_from(doc, 7, 100).unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![8, 9, 10]);
        assert_eq!(store.read_from(doc, 0, 2).unwrap().len(), 2);
        assert_eq!(store.head(doc).unwrap(), 10);
        assert!(store.read_from(DocumentId::from_u128(2), 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_out_of_order() {
        let doc = DocumentId::from_u128(1);
        let mut store = MemoryLogStore::new();
        store.append(doc, &entry(5)).unwrap();
        assert!(matches!(
            store.append(doc, &entry(5)),
            Err(StoreError::OutOfOrder { head: 5, .. })
        ));
    }

    #[test]
    fn test_checkpoint_per_document() {
        let doc = DocumentId::from_u128(1);
        let mut store = MemoryLogStore::new();
        assert!(store.load_checkpoint(doc).unwrap().is_none());

        let checkpoint = Checkpoint { seq: 3, snapshot: Snapshot::empty() };
        store.save_checkpoint(doc, &checkpoint).unwrap();
        assert_eq!(store.load_checkpoint(doc).unwrap(), Some(checkpoint));
        assert!(store.load_checkpoint(DocumentId::from_u128(2)).unwrap().is_none());
    }
}
