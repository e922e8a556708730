//! # hwt-collab — replicated document synchronization
//!
//! Operation-based CRDT engine for collaborative editing of structured
//! design documents: every replica applies edits locally without waiting,
//! and all replicas converge once they have seen the same operations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐                ┌──────────────────────┐
//! │ SyncEngine (one task/replica)│   SyncMessage  │ Relay                │
//! │  DocumentReplica  ◄─ clock   │ ◄────────────► │  RelaySession / doc  │
//! │   ├ OperationLog             │  ChannelTrans. │   ├ seq + tail       │
//! │   ├ pending (causal buffer)  │  or WebSocket  │   ├ checkpoint       │
//! │   └ ConflictDetector         │                │   ├ LeaseTable       │
//! │  OfflineQueue                │                │   └ BroadcastGroup   │
//! │  PresenceTracker / Throttle  │                │  LogStore (optional) │
//! └──────────────────────────────┘                └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`] — Lamport timestamps, total order with site tie-break
//! - [`element`] / [`operation`] — data model and the closed op set
//! - [`replica`] — per-field LWW state, causal buffering, snapshot merge
//! - [`oplog`] — append-only per-replica operation history
//! - [`conflict`] — classification of auto-resolved collisions
//! - [`presence`] — ephemeral cursors/selections with expiry
//! - [`offline`] — bounded queue for edits made while disconnected
//! - [`engine`] — serialized intake tying the pieces to a transport
//! - [`protocol`] — bincode wire messages
//! - [`relay`] / [`broadcast`] / [`lease`] — per-document relay sessions
//! - [`transport`] / [`client`] / [`server`] — in-process and WebSocket links
//! - [`storage`] — relay log stores (memory, file, RocksDB)

pub mod broadcast;
pub mod client;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod element;
pub mod engine;
pub mod error;
pub mod events;
pub mod lease;
pub mod offline;
pub mod operation;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod replica;
pub mod server;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use clock::{LamportClock, LamportTimestamp, SiteId};
pub use config::{EngineConfig, RelayConfig};
pub use conflict::{Conflict, ConflictKind};
pub use element::{Element, ElementId, FieldName, FieldValue};
pub use engine::{spawn_engine, EngineHandle, LinkState, SyncEngine};
pub use error::SyncError;
pub use events::SyncEvent;
pub use operation::{AppliedOp, OpId, OpKind, Operation, Origin};
pub use presence::{Activity, Cursor, PresenceMessage, PresenceRecord, PresenceTracker};
pub use protocol::{DocumentId, ProtocolError, SequencedOp, SyncMessage};
pub use relay::{RelayHub, RelaySession};
pub use replica::{ApplyResult, Dependency, DocumentReplica, MergeOutcome, Snapshot};
pub use client::{ClientConfig, WsTransport};
pub use server::{RelayServer, ServerConfig};
pub use storage::{Checkpoint, FileLogStore, LogStore, MemoryLogStore, StoreError};
pub use transport::{ChannelTransport, LocalRelay, SyncTransport, TransportError, TransportEvent};
