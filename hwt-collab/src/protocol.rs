//! Wire protocol between replicas and the relay.
//!
//! Every frame is one bincode-encoded [`SyncMessage`]. A connection is bound
//! to a single document by its first `Join`; the relay then stamps each
//! accepted operation with a per-document sequence number:
//!
//! ```text
//!  replica                      relay                       other replicas
//!    │── Join{doc, since} ───────►│
//!    │◄────── Welcome{head} ──────│
//!    │── Operation(op) ──────────►│── OpRelay{seq, op} ─────────►│
//!    │◄────── Accepted{op, seq} ──│
//!    │── CatchUp{since, full} ───►│
//!    │◄── Snapshot? + LogTail ────│
//! ```
//!
//! The relay never interprets operation contents.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::SiteId;
use crate::element::ElementId;
use crate::operation::{OpId, Operation};
use crate::presence::PresenceMessage;
use crate::replica::Snapshot;

/// Identifies one shared document (one relay session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for DocumentId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An operation with the relay sequence number it was accepted under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedOp {
    pub seq: u64,
    pub op: Operation,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Attach to a document. `since` is the last contiguous relay sequence
    /// the replica has applied, if any.
    Join {
        doc_id: DocumentId,
        site_id: SiteId,
        since: Option<u64>,
    },
    /// Join accepted. `head` is the newest relay sequence number.
    Welcome {
        doc_id: DocumentId,
        head: u64,
        participants: Vec<SiteId>,
    },
    /// A locally generated operation, replica → relay.
    Operation(Operation),
    /// The relay stored the sender's operation under `seq`.
    Accepted { op_id: OpId, seq: u64 },
    /// Another replica's operation, relay → replica.
    OpRelay(SequencedOp),
    /// Ask for everything after `since`; `full` forces a snapshot.
    CatchUp { since: u64, full: bool },
    /// Retained operations, oldest first.
    LogTail { ops: Vec<SequencedOp>, head: u64 },
    /// Checkpoint covering every operation up to `seq`; a `LogTail` follows.
    Snapshot { seq: u64, snapshot: Snapshot },
    /// Ephemeral presence, forwarded but never stored.
    Presence(PresenceMessage),
    /// Clean departure.
    Leave { site_id: SiteId },
    LeaseAcquire { element: ElementId },
    LeaseGranted {
        element: ElementId,
        holder: SiteId,
        expires_in: Duration,
    },
    LeaseDenied { element: ElementId, holder: SiteId },
    LeaseRelease { element: ElementId },
    /// The relay dropped messages for this peer; it must catch up from its
    /// own cursor. `head` is the relay's newest sequence.
    ResyncRequired { head: u64 },
    /// Join refused, e.g. the session is full.
    Rejected { reason: String },
    Ping,
    Pong,
}

impl SyncMessage {
    /// Short variant name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::Join { .. } => "Join",
            SyncMessage::Welcome { .. } => "Welcome",
            SyncMessage::Operation(_) => "Operation",
            SyncMessage::Accepted { .. } => "Accepted",
            SyncMessage::OpRelay(_) => "OpRelay",
            SyncMessage::CatchUp { .. } => "CatchUp",
            SyncMessage::LogTail { .. } => "LogTail",
            SyncMessage::Snapshot { .. } => "Snapshot",
            SyncMessage::Presence(_) => "Presence",
            SyncMessage::Leave { .. } => "Leave",
            SyncMessage::LeaseAcquire { .. } => "LeaseAcquire",
            SyncMessage::LeaseGranted { .. } => "LeaseGranted",
            SyncMessage::LeaseDenied { .. } => "LeaseDenied",
            SyncMessage::LeaseRelease { .. } => "LeaseRelease",
            SyncMessage::ResyncRequired { .. } => "ResyncRequired",
            SyncMessage::Rejected { .. } => "Rejected",
            SyncMessage::Ping => "Ping",
            SyncMessage::Pong => "Pong",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Encode(String),
    #[error("deserialization error: {0}")]
    Decode(String),
    #[error("unexpected {got} before Join")]
    NotJoined { got: &'static str },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
