//! Observable engine events.
//!
//! Delivered on a `tokio::sync::broadcast` channel; slow consumers lag
//! rather than block the replica.

use std::time::Duration;

use crate::clock::SiteId;
use crate::conflict::Conflict;
use crate::element::ElementId;
use crate::operation::OpId;
use crate::replica::Dependency;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An auto-resolved collision worth showing to the user.
    ConflictDetected(Conflict),
    /// A buffered operation waited too long for a dependency.
    IntegrityGap {
        op_id: OpId,
        missing: Vec<Dependency>,
        waited: Duration,
    },
    /// The replica asked the relay for a full snapshot.
    ResyncRequested,
    /// A snapshot was merged into local state.
    SnapshotMerged {
        changed_fields: usize,
        superseded: usize,
    },
    /// Missed operations were replayed from the relay's log tail.
    CaughtUp { operations: usize },
    CollaboratorJoined(SiteId),
    CollaboratorLeft(SiteId),
    /// The offline queue is full; the operation stays in the local log and
    /// is replayed after the queue on reconnect.
    QueueOverflow { op_id: OpId, capacity: usize },
    /// Queued operations were handed to the transport.
    QueueReplayed { operations: usize },
    TransportConnected,
    TransportDisconnected,
    LeaseGranted {
        element: ElementId,
        expires_in: Duration,
    },
    LeaseContention {
        element: ElementId,
        holder: SiteId,
    },
}
