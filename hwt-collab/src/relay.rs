//! The relay: one explicit session object per document.
//!
//! ```text
//! peer A ──┐                      ┌── RelaySession (doc) ─────────────────┐
//!          ├── serve_peer ──────► │ seq counter   retained tail           │
//! peer B ──┘                      │ checkpoint    LeaseTable              │
//!     ▲                           │ BroadcastGroup ── OpRelay/Presence ──►│──► peers
//!     └── Accepted / LogTail ─────┤ LogStore (optional)                   │
//!                                 └───────────────────────────────────────┘
//! ```
//!
//! A session is created when the first participant joins and destroyed,
//! after persisting a final checkpoint, when the last one leaves. The relay
//! sequences operations but never reorders, merges or rejects them.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use crate::broadcast::{BroadcastGroup, BroadcastStats, Relayed};
use crate::clock::SiteId;
use crate::config::{EngineConfig, RelayConfig};
use crate::element::ElementId;
use crate::lease::{LeaseDecision, LeaseTable};
use crate::operation::{OpId, Operation};
use crate::protocol::{DocumentId, ProtocolError, SequencedOp, SyncMessage};
use crate::replica::{DocumentReplica, Snapshot};
use crate::storage::{Checkpoint, SharedStore, StoreError};

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

pub struct RelaySession {
    doc_id: DocumentId,
    config: RelayConfig,
    head: u64,
    /// Every operation after `checkpoint.seq`, plus older ones up to `retention`.
    retained: VecDeque<SequencedOp>,
    accepted: HashMap<OpId, u64>,
    checkpoint: Checkpoint,
    since_checkpoint: usize,
    /// The checkpoint plus every operation after it, so checkpoints can be
    /// cut at any time. Rebuilt at each checkpoint to keep it bounded.
    replica: DocumentReplica,
    participants: BTreeSet<SiteId>,
    leases: LeaseTable,
    broadcast: BroadcastGroup,
    store: Option<SharedStore>,
}

impl RelaySession {
    /// Create a session, restoring the last checkpoint and log tail from
    /// `store` when one is configured.
    pub async fn open(
        doc_id: DocumentId,
        config: RelayConfig,
        store: Option<SharedStore>,
    ) -> Result<Self, StoreError> {
        let mut session = Self {
            doc_id,
            head: 0,
            retained: VecDeque::new(),
            accepted: HashMap::new(),
            checkpoint: Checkpoint {
                seq: 0,
                snapshot: Snapshot::empty(),
            },
            since_checkpoint: 0,
            replica: DocumentReplica::new(SiteId::nil(), EngineConfig::default()),
            participants: BTreeSet::new(),
            leases: LeaseTable::new(config.lease_duration),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            config,
            store,
        };

        if let Some(store) = session.store.clone() {
            let (checkpoint, tail) = {
                let store = store.lock().await;
                let checkpoint = store.load_checkpoint(doc_id)?;
                let from = checkpoint.as_ref().map_or(0, |c| c.seq);
                (checkpoint, store.read_from(doc_id, from, usize::MAX)?)
            };
            if let Some(checkpoint) = checkpoint {
                session.replica.merge(&checkpoint.snapshot);
                session.head = checkpoint.seq;
                session.checkpoint = checkpoint;
            }
            let restored = tail.len();
            for entry in tail {
                session.record(entry);
            }
            log::info!(
                "Restored document {doc_id}: checkpoint at {}, {restored} operations after it",
                session.checkpoint.seq
            );
        }

        Ok(session)
    }

    /// Add a participant. `None` when the session is full.
    pub fn join(&mut self, site: SiteId) -> Option<(SyncMessage, broadcast::Receiver<Arc<Relayed>>)> {
        if !self.participants.contains(&site)
            && self.participants.len() >= self.config.max_peers_per_session
        {
            log::warn!("Document {} is full, refusing {site}", self.doc_id);
            return None;
        }
        self.participants.insert(site);
        log::info!(
            "{site} joined document {} ({} participants, head {})",
            self.doc_id,
            self.participants.len(),
            self.head
        );

        let welcome = SyncMessage::Welcome {
            doc_id: self.doc_id,
            head: self.head,
            participants: self.participants.iter().copied().filter(|p| *p != site).collect(),
        };
        Some((welcome, self.broadcast.subscribe()))
    }

    /// Remove a participant and its leases. Returns `true` when the session
    /// is now empty.
    pub fn leave(&mut self, site: SiteId, explicit: bool) -> bool {
        self.participants.remove(&site);
        let released = self.leases.release_all(site);
        if !released.is_empty() {
            log::debug!("Released {} leases held by {site}", released.len());
        }
        if explicit {
            self.broadcast.broadcast(site, SyncMessage::Leave { site_id: site });
        }
        log::info!("{site} left document {}", self.doc_id);
        self.participants.is_empty()
    }

    /// Sequence, persist and relay an operation; the reply goes to the sender.
    ///
    /// A resent operation is acknowledged again without a new sequence.
    pub async fn accept(&mut self, from: SiteId, op: Operation) -> SyncMessage {
        let op_id = op.op_id;
        if let Some(seq) = self.accepted.get(&op_id) {
            return SyncMessage::Accepted { op_id, seq: *seq };
        }
        if self.replica.log().contains(&op_id) || self.replica.has_seen(&op_id) {
            // Already folded into the checkpoint; its sequence is no longer known.
            return SyncMessage::Accepted { op_id, seq: 0 };
        }

        let entry = SequencedOp { seq: self.head + 1, op };
        if let Some(store) = &self.store {
            if let Err(e) = store.lock().await.append(self.doc_id, &entry) {
                log::error!("Failed to persist operation {op_id} for {}: {e}", self.doc_id);
            }
        }

        let seq = entry.seq;
        self.record(entry.clone());
        log::trace!("Accepted {op_id} from {from} as {seq}");
        self.broadcast.broadcast(from, SyncMessage::OpRelay(entry));

        if self.since_checkpoint >= self.config.checkpoint_interval {
            self.take_checkpoint().await;
        }
        self.trim();
        SyncMessage::Accepted { op_id, seq }
    }

    /// Answer a catch-up request: a log tail when it is retained and a
    /// snapshot was not asked for, otherwise checkpoint plus tail.
    pub fn catch_up(&self, since: u64, full: bool) -> Vec<SyncMessage> {
        // Every operation after `floor` is retained.
        let floor = self
            .retained
            .front()
            .map_or(self.head, |e| e.seq.saturating_sub(1));

        if !full && since >= floor {
            return vec![SyncMessage::LogTail {
                ops: self.tail_after(since),
                head: self.head,
            }];
        }

        log::debug!(
            "Serving snapshot at {} to a peer at {since} (head {})",
            self.checkpoint.seq,
            self.head
        );
        vec![
            SyncMessage::Snapshot {
                seq: self.checkpoint.seq,
                snapshot: self.checkpoint.snapshot.clone(),
            },
            SyncMessage::LogTail {
                ops: self.tail_after(self.checkpoint.seq),
                head: self.head,
            },
        ]
    }

    pub fn acquire_lease(&mut self, element: ElementId, site: SiteId, now: Instant) -> SyncMessage {
        for (element, holder) in self.leases.expire(now) {
            log::debug!("Lease on {element} held by {holder} expired");
        }
        match self.leases.acquire(element, site, now) {
            LeaseDecision::Granted { expires_in } => SyncMessage::LeaseGranted {
                element,
                holder: site,
                expires_in,
            },
            LeaseDecision::Denied { holder } => {
                log::debug!("Lease on {element} denied to {site}: held by {holder}");
                SyncMessage::LeaseDenied { element, holder }
            }
        }
    }

    pub fn release_lease(&mut self, element: &ElementId, site: SiteId) -> bool {
        self.leases.release(element, site)
    }

    /// Relay an ephemeral message without storing it.
    pub fn forward(&self, from: SiteId, msg: SyncMessage) {
        self.broadcast.broadcast(from, msg);
    }

    /// Cut a fresh checkpoint and persist it.
    pub async fn close(&mut self) {
        self.take_checkpoint().await;
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn checkpoint_seq(&self) -> u64 {
        self.checkpoint.seq
    }

    pub fn retained(&self) -> usize {
        self.retained.len()
    }

    pub fn participants(&self) -> Vec<SiteId> {
        self.participants.iter().copied().collect()
    }

    /// Operations held by the folding replica.
    pub fn folded(&self) -> usize {
        self.replica.log().len()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    fn note_lag(&self) {
        self.broadcast.record_lag();
    }

    fn record(&mut self, entry: SequencedOp) {
        self.replica.apply_history_at(entry.op.clone(), Instant::now());
        self.accepted.insert(entry.op.op_id, entry.seq);
        self.head = entry.seq;
        self.retained.push_back(entry);
        self.since_checkpoint += 1;
    }

    fn tail_after(&self, since: u64) -> Vec<SequencedOp> {
        self.retained
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect()
    }

    /// Highest sequence whose operation and all before it are in the replica.
    fn covered_seq(&self) -> u64 {
        let mut seq = self.checkpoint.seq;
        for entry in self.retained.iter().filter(|e| e.seq > self.checkpoint.seq) {
            if !self.replica.has_seen(&entry.op.op_id) {
                break;
            }
            seq = entry.seq;
        }
        seq
    }

    async fn take_checkpoint(&mut self) {
        self.checkpoint = Checkpoint {
            seq: self.covered_seq(),
            snapshot: self.replica.snapshot(),
        };
        self.since_checkpoint = 0;
        self.rebuild_replica();
        log::debug!("Checkpoint for {} at {}", self.doc_id, self.checkpoint.seq);

        if let Some(store) = &self.store {
            if let Err(e) = store.lock().await.save_checkpoint(self.doc_id, &self.checkpoint) {
                log::error!("Failed to persist checkpoint for {}: {e}", self.doc_id);
            }
        }
    }

    /// Restart the replica from the checkpoint so its log and seen set only
    /// cover operations after it.
    fn rebuild_replica(&mut self) {
        let now = Instant::now();
        let mut replica = DocumentReplica::new(SiteId::nil(), EngineConfig::default());
        replica.merge_at(&self.checkpoint.snapshot, now);
        for entry in self.retained.iter().filter(|e| e.seq > self.checkpoint.seq) {
            replica.apply_history_at(entry.op.clone(), now);
        }
        self.replica = replica;
    }

    /// Drop retained operations beyond `retention`, never past the checkpoint.
    fn trim(&mut self) {
        while self.retained.len() > self.config.retention {
            match self.retained.front() {
                Some(front) if front.seq <= self.checkpoint.seq => {
                    let op_id = front.op.op_id;
                    self.retained.pop_front();
                    self.accepted.remove(&op_id);
                }
                _ => break,
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Hub: document id → session
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_sessions: usize,
}

type JoinedSession = (Arc<Mutex<RelaySession>>, SyncMessage, broadcast::Receiver<Arc<Relayed>>);

/// Owns every live session. Shared by all connections of one relay.
pub struct RelayHub {
    config: RelayConfig,
    store: Option<SharedStore>,
    sessions: RwLock<HashMap<DocumentId, Arc<Mutex<RelaySession>>>>,
    total_connections: AtomicU64,
}

impl RelayHub {
    pub fn new(config: RelayConfig, store: Option<SharedStore>) -> Self {
        Self {
            config,
            store,
            sessions: RwLock::new(HashMap::new()),
            total_connections: AtomicU64::new(0),
        }
    }

    /// Join `doc_id`, creating its session on first use.
    ///
    /// Holds the registry lock across creation and join so a concurrent
    /// teardown cannot hand out a dead session.
    pub async fn join(&self, doc_id: DocumentId, site: SiteId) -> Result<Option<JoinedSession>, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = match sessions.get(&doc_id) {
            Some(session) => session.clone(),
            None => {
                let session = RelaySession::open(doc_id, self.config.clone(), self.store.clone()).await?;
                let session = Arc::new(Mutex::new(session));
                sessions.insert(doc_id, session.clone());
                log::info!("Session for {doc_id} created");
                session
            }
        };

        let joined = session.lock().await.join(site);
        if joined.is_some() {
            self.total_connections.fetch_add(1, Ordering::Relaxed);
        }
        Ok(joined.map(|(welcome, rx)| (session.clone(), welcome, rx)))
    }

    /// Remove `site` from `doc_id`, tearing the session down if it was the
    /// last participant.
    pub async fn depart(&self, doc_id: DocumentId, site: SiteId, explicit: bool) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(&doc_id).cloned() else {
            return;
        };
        let mut session = session.lock().await;
        if session.leave(site, explicit) {
            session.close().await;
            sessions.remove(&doc_id);
            log::info!("Session for {doc_id} closed (empty)");
        }
    }

    pub async fn session(&self, doc_id: &DocumentId) -> Option<Arc<Mutex<RelaySession>>> {
        self.sessions.read().await.get(doc_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_sessions: self.session_count().await,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

// ───────────────────────────────────────────────────────────────────
// Per-connection loop
// ───────────────────────────────────────────────────────────────────

/// Drive one peer connection until either side goes away.
///
/// `inbound` carries decoded messages from the peer, `outbound` carries
/// messages to it; transports only move frames between these channels and
/// the wire.
pub async fn serve_peer(
    hub: Arc<RelayHub>,
    mut inbound: mpsc::UnboundedReceiver<SyncMessage>,
    outbound: mpsc::Sender<SyncMessage>,
) {
    let (doc_id, site_id) = loop {
        match inbound.recv().await {
            Some(SyncMessage::Join { doc_id, site_id, .. }) => break (doc_id, site_id),
            Some(SyncMessage::Ping) => {
                if outbound.send(SyncMessage::Pong).await.is_err() {
                    return;
                }
            }
            Some(other) => log::warn!("{}", ProtocolError::NotJoined { got: other.name() }),
            None => return,
        }
    };

    let (session, welcome, mut relayed) = match hub.join(doc_id, site_id).await {
        Ok(Some(joined)) => joined,
        Ok(None) => {
            let reason = "session is full".to_string();
            let _ = outbound.send(SyncMessage::Rejected { reason }).await;
            return;
        }
        Err(e) => {
            log::error!("Failed to open session for {doc_id}: {e}");
            let _ = outbound.send(SyncMessage::Rejected { reason: e.to_string() }).await;
            return;
        }
    };

    let mut explicit = false;
    if outbound.send(welcome).await.is_ok() {
        'session: loop {
            tokio::select! {
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break 'session };
                    if matches!(msg, SyncMessage::Leave { .. }) {
                        explicit = true;
                        break 'session;
                    }
                    for reply in handle(&session, site_id, msg).await {
                        if outbound.send(reply).await.is_err() {
                            break 'session;
                        }
                    }
                }

                item = relayed.recv() => {
                    match item {
                        Ok(entry) => {
                            if entry.from != site_id
                                && outbound.send(entry.msg.clone()).await.is_err()
                            {
                                break 'session;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("{site_id} lagged by {n} messages on {doc_id}");
                            let head = {
                                let session = session.lock().await;
                                session.note_lag();
                                session.head()
                            };
                            if outbound.send(SyncMessage::ResyncRequired { head }).await.is_err() {
                                break 'session;
                            }
                        }
                        Err(RecvError::Closed) => break 'session,
                    }
                }
            }
        }
    }

    hub.depart(doc_id, site_id, explicit).await;
}

async fn handle(session: &Mutex<RelaySession>, site: SiteId, msg: SyncMessage) -> Vec<SyncMessage> {
    let mut session = session.lock().await;
    match msg {
        SyncMessage::Operation(op) => vec![session.accept(site, op).await],
        SyncMessage::CatchUp { since, full } => session.catch_up(since, full),
        SyncMessage::Presence(presence) => {
            session.forward(site, SyncMessage::Presence(presence));
            Vec::new()
        }
        SyncMessage::LeaseAcquire { element } => {
            vec![session.acquire_lease(element, site, Instant::now())]
        }
        SyncMessage::LeaseRelease { element } => {
            session.release_lease(&element, site);
            Vec::new()
        }
        SyncMessage::Ping => vec![SyncMessage::Pong],
        other => {
            log::debug!("Ignoring {} from {site}", other.name());
            Vec::new()
        }
    }
}
