//! Fan-out of relayed messages to every participant of a session.
//!
//! One tokio broadcast channel per document: a send is O(1) regardless of
//! participant count, and each participant drains its own receiver. A
//! receiver that falls more than `capacity` messages behind lags; the
//! relay then tells that peer to catch up by cursor instead of blocking
//! the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::clock::SiteId;
use crate::protocol::SyncMessage;

/// A message on its way to every participant except `from`.
#[derive(Debug, Clone, PartialEq)]
pub struct Relayed {
    pub from: SiteId,
    pub msg: SyncMessage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub lagged_receivers: u64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Relayed>>,
    capacity: usize,
    messages_sent: AtomicU64,
    lagged_receivers: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
            lagged_receivers: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Relayed>> {
        self.sender.subscribe()
    }

    /// Send to every subscriber; returns how many received it.
    pub fn broadcast(&self, from: SiteId, msg: SyncMessage) -> usize {
        let count = self.sender.send(Arc::new(Relayed { from, msg })).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn record_lag(&self) {
        self.lagged_receivers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            lagged_receivers: self.lagged_receivers.load(Ordering::Relaxed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
