//! Error taxonomy of the synchronization engine.
//!
//! Causality and conflict handling never produce errors for the caller.
//! Duplicates, integrity gaps and queue overflow are reported on the
//! [`SyncEvent`](crate::events::SyncEvent) stream instead. What remains are
//! caller mistakes on the local edit path, lost lease races, connectivity
//! and transport setup.

use thiserror::Error;

use crate::clock::SiteId;
use crate::element::ElementId;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport disconnected")]
    TransportDisconnected,

    #[error("lease on {element} is held by {holder}")]
    LeaseContention { element: ElementId, holder: SiteId },

    #[error("no answer from the relay for the lease on {0}")]
    LeaseTimeout(ElementId),

    #[error("element not found: {0}")]
    UnknownElement(ElementId),

    #[error("element already exists: {0}")]
    ElementExists(ElementId),

    #[error("sync engine has shut down")]
    EngineClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
