//! Append-only, deduplicated operation log.
//!
//! Every operation a replica receives, local or remote, is recorded exactly
//! once. Entries are never removed; only their status moves forward
//! (`Pending` → `Applied`, or `Pending` → `Superseded` when a snapshot
//! already covers the operation).

use std::collections::HashMap;

use crate::clock::SiteId;
use crate::operation::{OpId, Operation};

/// Integration state of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Applied,
    /// Waiting on a causal dependency.
    Pending,
    /// Covered by a merged snapshot before its dependencies arrived.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Position in this log (0-based, dense).
    pub seq: u64,
    pub op: Operation,
    pub status: LogStatus,
}

#[derive(Debug, Default)]
pub struct OperationLog {
    entries: Vec<LogEntry>,
    index: HashMap<OpId, usize>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation. Returns its sequence number, or `None` if the
    /// op id is already present.
    pub fn append(&mut self, op: Operation, status: LogStatus) -> Option<u64> {
        if self.index.contains_key(&op.op_id) {
            return None;
        }
        let seq = self.entries.len() as u64;
        self.index.insert(op.op_id, self.entries.len());
        self.entries.push(LogEntry { seq, op, status });
        Some(seq)
    }

    pub fn contains(&self, op_id: &OpId) -> bool {
        self.index.contains_key(op_id)
    }

    pub fn get(&self, op_id: &OpId) -> Option<&LogEntry> {
        self.index.get(op_id).map(|&i| &self.entries[i])
    }

    pub fn status(&self, op_id: &OpId) -> Option<LogStatus> {
        self.get(op_id).map(|e| e.status)
    }

    /// Move an entry to a new status. Applied entries stay applied.
    pub fn set_status(&mut self, op_id: &OpId, status: LogStatus) -> bool {
        match self.index.get(op_id) {
            Some(&i) if self.entries[i].status != LogStatus::Applied => {
                self.entries[i].status = status;
                true
            }
            _ => false,
        }
    }

    /// Range read: up to `limit` entries starting at `cursor`.
    pub fn read_from(&self, cursor: u64, limit: usize) -> &[LogEntry] {
        let start = (cursor as usize).min(self.entries.len());
        let end = start.saturating_add(limit).min(self.entries.len());
        &self.entries[start..end]
    }

    /// Operations authored by `site`, in log order.
    pub fn local_ops(&self, site: SiteId) -> impl Iterator<Item = &Operation> {
        self.entries
            .iter()
            .map(|e| &e.op)
            .filter(move |op| op.site_id == site)
    }

    /// Highest Lamport counter in the log (clock recovery).
    pub fn max_counter(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.op.timestamp.counter)
            .max()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Next sequence number to be assigned.
    pub fn head(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LamportTimestamp;
    use crate::element::ElementId;
    use crate::operation::OpKind;

    fn op(counter: u64, site: u128) -> Operation {
        Operation::new(
            LamportTimestamp::new(counter, SiteId::from_u128(site)),
            ElementId::from_u128(1),
            OpKind::Delete,
            Vec::new(),
        )
    }

    #[test]
    fn test_append_deduplicates() {
        let mut log = OperationLog::new();
        let a = op(1, 1);
        assert_eq!(log.append(a.clone(), LogStatus::Applied), Some(0));
        assert_eq!(log.append(a, LogStatus::Applied), None);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_read_from_cursor() {
        let mut log = OperationLog::new();
        for i in 1..=5 {
            log.append(op(i, 1), LogStatus::Applied);
        }
        let page = log.read_from(2, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].seq, 2);
        assert_eq!(page[1].op.timestamp.counter, 4);
        assert!(log.read_from(10, 3).is_empty());
        assert_eq!(log.read_from(4, usize::MAX).len(), 1);
    }

    #[test]
    fn test_applied_status_is_final() {
        let mut log = OperationLog::new();
        let a = op(1, 1);
        let id = a.op_id;
        log.append(a, LogStatus::Pending);
        assert!(log.set_status(&id, LogStatus::Applied));
        assert!(!log.set_status(&id, LogStatus::Superseded));
        assert_eq!(log.status(&id), Some(LogStatus::Applied));
    }

    #[test]
    fn test_local_ops_and_max_counter() {
        let mut log = OperationLog::new();
        log.append(op(3, 1), LogStatus::Applied);
        log.append(op(9, 2), LogStatus::Applied);
        log.append(op(4, 1), LogStatus::Applied);
        assert_eq!(log.local_ops(SiteId::from_u128(1)).count(), 2);
        assert_eq!(log.max_counter(), 9);
    }
}
