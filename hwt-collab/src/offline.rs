//! Offline queue for edits made while disconnected.
//!
//! Editing never blocks on connectivity: local operations are applied at
//! once and queued here until the transport comes back. The queue is
//! bounded. Operations past the bound are not dropped; only their ids are
//! remembered and the operations themselves are re-read from the operation
//! log on replay, after everything that fit in the queue.

use std::collections::VecDeque;

use crate::operation::{OpId, Operation};
use crate::oplog::OperationLog;

/// Result of [`OfflineQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// The queue was full; the operation will be replayed from the log.
    Overflowed,
}

pub struct OfflineQueue {
    queue: VecDeque<Operation>,
    overflow: Vec<OpId>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            overflow: Vec::new(),
            capacity,
        }
    }

    /// Queue a local operation for later replay.
    pub fn push(&mut self, op: Operation) -> Enqueued {
        if self.queue.len() >= self.capacity || !self.overflow.is_empty() {
            self.overflow.push(op.op_id);
            return Enqueued::Overflowed;
        }
        self.queue.push_back(op);
        Enqueued::Queued
    }

    /// Put unacknowledged operations back at the head, oldest first.
    ///
    /// They were sent before anything now queued, so order is preserved.
    /// Requeued operations are exempt from the bound.
    pub fn requeue_front(&mut self, ops: impl IntoIterator<Item = Operation>) {
        let ops: Vec<Operation> = ops.into_iter().collect();
        for op in ops.into_iter().rev() {
            self.queue.push_front(op);
        }
    }

    /// Take everything in original local order: queued operations, then the
    /// overflowed ones re-read from `log`.
    pub fn drain(&mut self, log: &OperationLog) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self.queue.drain(..).collect();
        for op_id in self.overflow.drain(..) {
            match log.get(&op_id) {
                Some(entry) => ops.push(entry.op.clone()),
                None => log::error!("Overflowed operation {op_id} missing from the log"),
            }
        }
        ops
    }

    /// Queued plus overflowed operations.
    pub fn len(&self) -> usize {
        self.queue.len() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.overflow.is_empty()
    }

    pub fn overflowed(&self) -> usize {
        self.overflow.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{LamportTimestamp, SiteId};
    use crate::element::ElementId;
    use crate::oplog::LogStatus;
    use crate::operation::OpKind;

    fn op(counter: u64) -> Operation {
        Operation::new(
            LamportTimestamp::new(counter, SiteId::from_u128(1)),
            ElementId::from_u128(1),
            OpKind::update("n", counter as i64),
            vec![],
        )
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OfflineQueue::new(8);
        let ops: Vec<Operation> = (1..=5).map(op).collect();
        for o in &ops {
            assert_eq!(queue.push(o.clone()), Enqueued::Queued);
        }
        assert_eq!(queue.drain(&OperationLog::new()), ops);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_replays_from_log() {
        let mut log = OperationLog::new();
        let mut queue = OfflineQueue::new(2);
        let ops: Vec<Operation> = (1..=4).map(op).collect();
        for o in &ops {
            log.append(o.clone(), LogStatus::Applied);
        }

        assert_eq!(queue.push(ops[0].clone()), Enqueued::Queued);
        assert_eq!(queue.push(ops[1].clone()), Enqueued::Queued);
        assert_eq!(queue.push(ops[2].clone()), Enqueued::Overflowed);
        assert_eq!(queue.push(ops[3].clone()), Enqueued::Overflowed);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.overflowed(), 2);

        assert_eq!(queue.drain(&log), ops);
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut queue = OfflineQueue::new(2);
        queue.push(op(3));
        queue.push(op(4));
        queue.requeue_front(vec![op(1), op(2)]);

        let counters: Vec<u64> = queue
            .drain(&OperationLog::new())
            .iter()
            .map(|o| o.timestamp.counter)
            .collect();
        assert_eq!(counters, vec![1, 2, 3, 4]);
    }
}
