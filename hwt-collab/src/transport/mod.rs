//! Transport abstraction between a replica and its relay.
//!
//! A transport moves [`SyncMessage`]s and reports connectivity; it never
//! interprets, reorders or deduplicates what it carries. Two
//! implementations exist: [`ChannelTransport`] talks to an in-process
//! [`LocalRelay`], and [`crate::client::WsTransport`] talks to a
//! [`crate::server::RelayServer`] over WebSocket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::protocol::{ProtocolError, SyncMessage};
use crate::relay::{serve_peer, RelayHub};
use crate::storage::SharedStore;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is disconnected")]
    Disconnected,
    #[error("transport has shut down")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// What a transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A (re)connection is up; nothing has been sent on it yet.
    Connected,
    Message(SyncMessage),
    Disconnected,
}

/// Content-agnostic message channel to a relay.
pub trait SyncTransport: Send + Sync + 'static {
    /// Best effort: fails while disconnected, never reorders.
    fn send(&self, msg: SyncMessage) -> Result<(), TransportError>;

    /// The event stream. Can be taken once.
    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Ask for a snapshot plus the operations after it. The answer
    /// arrives as a `Snapshot` message followed by a `LogTail`.
    fn request_snapshot(&self, since: u64) -> Result<(), TransportError> {
        self.send(SyncMessage::CatchUp { since, full: true })
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process relay
// ───────────────────────────────────────────────────────────────────

/// A relay living in the current process. Cheap to clone.
#[derive(Clone)]
pub struct LocalRelay {
    hub: Arc<RelayHub>,
}

impl LocalRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_store(config, None)
    }

    pub fn with_store(config: RelayConfig, store: Option<SharedStore>) -> Self {
        Self {
            hub: Arc::new(RelayHub::new(config, store)),
        }
    }

    /// Open a transport and connect it right away.
    pub fn connect(&self) -> ChannelTransport {
        let transport = ChannelTransport::new(self.hub.clone());
        transport.reconnect();
        transport
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }
}

struct Link {
    to_relay: mpsc::UnboundedSender<SyncMessage>,
    pump: JoinHandle<()>,
}

struct ChannelInner {
    hub: Arc<RelayHub>,
    link: Mutex<Option<Link>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    generation: Arc<AtomicU64>,
}

/// Transport to a [`LocalRelay`]. Clones share one connection, so a test
/// can keep a handle to cut and restore the link while an engine owns it.
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<ChannelInner>,
}

impl ChannelTransport {
    fn new(hub: Arc<RelayHub>) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ChannelInner {
                hub,
                link: Mutex::new(None),
                events,
                receiver: Mutex::new(Some(receiver)),
                generation: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Drop the current link, if any, and open a new one.
    pub fn reconnect(&self) {
        self.disconnect();

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (to_relay, inbound) = mpsc::unbounded_channel();
        let (outbound, from_relay) = mpsc::channel(self.inner.hub.config().broadcast_capacity);
        tokio::spawn(serve_peer(self.inner.hub.clone(), inbound, outbound));

        let _ = self.inner.events.send(TransportEvent::Connected);
        let pump = tokio::spawn(pump(
            from_relay,
            self.inner.events.clone(),
            self.inner.generation.clone(),
            generation,
        ));
        *self.lock_link() = Some(Link { to_relay, pump });
    }

    /// Cut the link. The relay sees an abrupt departure.
    pub fn disconnect(&self) {
        let Some(link) = self.lock_link().take() else {
            return;
        };
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        link.pump.abort();
        drop(link.to_relay);
        let _ = self.inner.events.send(TransportEvent::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.lock_link()
            .as_ref()
            .is_some_and(|link| !link.to_relay.is_closed())
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Link>> {
        self.inner.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SyncTransport for ChannelTransport {
    fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        match self.lock_link().as_ref() {
            Some(link) => link
                .to_relay
                .send(msg)
                .map_err(|_| TransportError::Disconnected),
            None => Err(TransportError::Disconnected),
        }
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Forward relay output as events; report the relay hanging up unless the
/// link was replaced in the meantime.
async fn pump(
    mut from_relay: mpsc::Receiver<SyncMessage>,
    events: mpsc::UnboundedSender<TransportEvent>,
    generation: Arc<AtomicU64>,
    mine: u64,
) {
    while let Some(msg) = from_relay.recv().await {
        if events.send(TransportEvent::Message(msg)).is_err() {
            return;
        }
    }
    if generation.load(Ordering::SeqCst) == mine {
        log::debug!("Local relay closed the link");
        let _ = events.send(TransportEvent::Disconnected);
    }
}
