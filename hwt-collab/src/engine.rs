//! The sync engine: one serialized intake per replica.
//!
//! [`SyncEngine`] is a synchronous state machine. Local edits, relay
//! messages and timer ticks all go through `&mut self`, and anything that
//! must reach the relay is appended to an outbox. [`spawn_engine`] runs it
//! as a single tokio task next to a [`SyncTransport`], so apply calls are
//! strictly ordered and never run concurrently.
//!
//! ```text
//!   EngineHandle ──Command──►┐
//!                            │   engine task (select!)
//!   SyncTransport ──Event───►├──► SyncEngine ──outbox──► SyncTransport
//!                            │
//!   interval ──tick─────────►┘
//! ```

use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::clock::SiteId;
use crate::config::EngineConfig;
use crate::element::{Element, ElementId, FieldName, FieldValue};
use crate::error::SyncError;
use crate::events::SyncEvent;
use crate::offline::{Enqueued, OfflineQueue};
use crate::operation::{AppliedOp, OpKind, Operation};
use crate::presence::{PresenceMessage, PresenceRecord, PresenceThrottle, PresenceTracker};
use crate::protocol::{DocumentId, SequencedOp, SyncMessage};
use crate::replica::{ApplyResult, DocumentReplica};
use crate::transport::{SyncTransport, TransportError, TransportEvent};

/// Connection phase as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// Transport is up, waiting for `Welcome`.
    Joining,
    Live,
}

pub struct SyncEngine {
    doc_id: DocumentId,
    replica: DocumentReplica,
    presence: PresenceTracker,
    throttle: PresenceThrottle,
    queue: OfflineQueue,
    /// Sent but not yet acknowledged, oldest first.
    in_flight: Vec<Operation>,
    /// Every relay sequence up to here has been applied.
    cursor: u64,
    ahead: BTreeSet<u64>,
    catching_up: bool,
    state: LinkState,
    local_presence: Option<PresenceMessage>,
    presence_sent_at: Option<Instant>,
    outbox: Vec<SyncMessage>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(doc_id: DocumentId, site_id: SiteId, config: EngineConfig) -> Self {
        Self::with_replica(doc_id, DocumentReplica::new(site_id, config))
    }

    /// Wrap an existing replica, e.g. one rebuilt with
    /// [`DocumentReplica::replay`].
    pub fn with_replica(doc_id: DocumentId, replica: DocumentReplica) -> Self {
        let events = replica.event_sender();
        let config = replica.config().clone();
        Self {
            doc_id,
            presence: PresenceTracker::new(replica.site_id()).with_events(events.clone()),
            throttle: PresenceThrottle::new(config.presence_interval()),
            queue: OfflineQueue::new(config.offline_queue_capacity),
            replica,
            in_flight: Vec::new(),
            cursor: 0,
            ahead: BTreeSet::new(),
            catching_up: false,
            state: LinkState::Disconnected,
            local_presence: None,
            presence_sent_at: None,
            outbox: Vec::new(),
            events,
        }
    }

    // ─── Local edits ────────────────────────────────────────────────

    pub fn insert<I, K>(&mut self, fields: I) -> Result<Operation, SyncError>
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<FieldName>,
    {
        self.apply_local(OpKind::insert(fields), ElementId::new())
    }

    pub fn update(
        &mut self,
        target: ElementId,
        field: impl Into<FieldName>,
        value: impl Into<FieldValue>,
    ) -> Result<Operation, SyncError> {
        self.apply_local(OpKind::update(field, value), target)
    }

    pub fn delete(&mut self, target: ElementId) -> Result<Operation, SyncError> {
        self.apply_local(OpKind::Delete, target)
    }

    /// Apply a local edit immediately, then send it or queue it.
    pub fn apply_local(&mut self, kind: OpKind, target: ElementId) -> Result<Operation, SyncError> {
        let op = self.replica.apply_local(kind, target)?;
        self.submit(op.clone());
        Ok(op)
    }

    fn submit(&mut self, op: Operation) {
        if self.state == LinkState::Live {
            self.in_flight.push(op.clone());
            self.outbox.push(SyncMessage::Operation(op));
            return;
        }

        let op_id = op.op_id;
        if self.queue.push(op) == Enqueued::Overflowed {
            let capacity = self.queue.capacity();
            log::warn!(
                "Offline queue full ({capacity}); {op_id} will be replayed from the log ({} overflowed)",
                self.queue.overflowed()
            );
            self.emit(SyncEvent::QueueOverflow { op_id, capacity });
        }
    }

    // ─── Transport lifecycle ────────────────────────────────────────

    pub fn on_connected(&mut self) {
        self.state = LinkState::Joining;
        self.ahead.clear();
        self.catching_up = false;
        let since = (self.cursor > 0).then_some(self.cursor);
        self.outbox.push(SyncMessage::Join {
            doc_id: self.doc_id,
            site_id: self.site_id(),
            since,
        });
        log::info!("{} connected, joining {} at {}", self.site_id(), self.doc_id, self.cursor);
        self.emit(SyncEvent::TransportConnected);
    }

    /// Editing continues locally; unacknowledged operations go back to
    /// the front of the offline queue.
    pub fn on_disconnected(&mut self) {
        if self.state == LinkState::Disconnected {
            return;
        }
        self.state = LinkState::Disconnected;
        self.catching_up = false;
        self.ahead.clear();
        let unacked = std::mem::take(&mut self.in_flight);
        if !unacked.is_empty() {
            log::debug!("Requeueing {} unacknowledged operations", unacked.len());
        }
        self.queue.requeue_front(unacked);
        // Nothing sent on a dead link is delivered.
        self.outbox.clear();
        log::info!("{} disconnected from {}", self.site_id(), self.doc_id);
        self.emit(SyncEvent::TransportDisconnected);
    }

    // ─── Relay messages ─────────────────────────────────────────────

    pub fn handle_message(&mut self, msg: SyncMessage, now: Instant) {
        match msg {
            SyncMessage::Welcome { head, participants, .. } => self.on_welcome(head, participants, now),
            SyncMessage::Accepted { op_id, seq } => {
                if let Some(pos) = self.in_flight.iter().position(|op| op.op_id == op_id) {
                    self.in_flight.remove(pos);
                }
                if seq > 0 {
                    self.advance(seq);
                }
            }
            SyncMessage::OpRelay(entry) => {
                self.apply_sequenced(entry, now, false);
                if !self.ahead.is_empty() && !self.catching_up {
                    log::debug!(
                        "Relay sequence gap after {} (next seen {:?})",
                        self.cursor,
                        self.ahead.first()
                    );
                    self.request_catch_up(false);
                }
            }
            SyncMessage::LogTail { ops, head } => {
                let operations = ops.len();
                for entry in ops {
                    self.apply_sequenced(entry, now, true);
                }
                self.catching_up = false;
                log::debug!("Caught up {operations} operations, cursor {} of {head}", self.cursor);
                self.emit(SyncEvent::CaughtUp { operations });
            }
            SyncMessage::Snapshot { seq, snapshot } => {
                self.replica.merge_at(&snapshot, now);
                if seq > self.cursor {
                    self.cursor = seq;
                }
                self.ahead.retain(|s| *s > seq);
                self.advance(seq);
            }
            SyncMessage::Presence(presence) => {
                self.presence.update(&presence, now);
            }
            SyncMessage::Leave { site_id } => {
                self.presence.remove(&site_id);
            }
            SyncMessage::LeaseGranted { element, holder, expires_in } => {
                if holder == self.site_id() {
                    self.emit(SyncEvent::LeaseGranted { element, expires_in });
                }
            }
            SyncMessage::LeaseDenied { element, holder } => {
                log::warn!("Lease on {element} is held by {holder}");
                self.emit(SyncEvent::LeaseContention { element, holder });
            }
            SyncMessage::ResyncRequired { head } => {
                log::warn!("Relay dropped messages for {}; resyncing from {} (head {head})", self.site_id(), self.cursor);
                self.catching_up = false;
                self.catch_up_to(head);
            }
            SyncMessage::Rejected { reason } => {
                log::error!("Relay rejected {} on {}: {reason}", self.site_id(), self.doc_id);
            }
            SyncMessage::Pong => log::trace!("Pong"),
            other => log::debug!("Ignoring {} from relay", other.name()),
        }
    }

    fn on_welcome(&mut self, head: u64, participants: Vec<SiteId>, now: Instant) {
        if head < self.cursor {
            log::warn!(
                "Relay head {head} is behind local cursor {}; relay lost history, starting over",
                self.cursor
            );
            self.cursor = 0;
        }
        self.state = LinkState::Live;
        log::info!(
            "{} joined {} (head {head}, {} other participants)",
            self.site_id(),
            self.doc_id,
            participants.len()
        );

        let queued = self.queue.drain(self.replica.log());
        if !queued.is_empty() {
            let operations = queued.len();
            log::info!("Replaying {operations} queued operations");
            for op in queued {
                self.in_flight.push(op.clone());
                self.outbox.push(SyncMessage::Operation(op));
            }
            self.emit(SyncEvent::QueueReplayed { operations });
        }

        self.catch_up_to(head);

        if let Some(presence) = self.local_presence.clone() {
            if let Some(out) = self.throttle.offer(presence, now) {
                self.send_presence(out, now);
            }
        }
    }

    /// Pick tail replay or a snapshot by the size of the gap.
    fn catch_up_to(&mut self, head: u64) {
        let gap = head.saturating_sub(self.cursor);
        if gap == 0 {
            return;
        }
        let full = gap > self.replica.config().max_tail_replay;
        if full {
            log::info!("{gap} operations behind; requesting a snapshot");
        }
        self.request_catch_up(full);
    }

    fn request_catch_up(&mut self, full: bool) {
        if self.state != LinkState::Live {
            return;
        }
        self.catching_up = true;
        self.outbox.push(SyncMessage::CatchUp {
            since: self.cursor,
            full,
        });
        if full {
            self.emit(SyncEvent::ResyncRequested);
        }
    }

    /// `history` marks catch-up replay, which is not classified for conflicts.
    fn apply_sequenced(&mut self, entry: SequencedOp, now: Instant, history: bool) {
        let result = if history {
            self.replica.apply_history_at(entry.op, now)
        } else {
            self.replica.apply_remote_at(entry.op, now)
        };
        if let ApplyResult::Buffered { missing } = result {
            log::trace!("Operation {} buffered on {} dependencies", entry.seq, missing.len());
        }
        self.advance(entry.seq);
    }

    fn advance(&mut self, seq: u64) {
        if seq <= self.cursor {
            return;
        }
        self.ahead.insert(seq);
        while self.ahead.remove(&(self.cursor + 1)) {
            self.cursor += 1;
        }
    }

    // ─── Presence & leases ──────────────────────────────────────────

    /// Record local presence and send it, rate limited. Lossy offline.
    pub fn update_presence(&mut self, msg: PresenceMessage, now: Instant) {
        let merged = match self.local_presence.take() {
            Some(previous) => PresenceMessage {
                cursor: msg.cursor.or(previous.cursor),
                selection: msg.selection.clone().or(previous.selection),
                ..msg.clone()
            },
            None => msg.clone(),
        };
        self.local_presence = Some(merged);

        if self.state == LinkState::Live {
            if let Some(out) = self.throttle.offer(msg, now) {
                self.send_presence(out, now);
            }
        }
    }

    fn send_presence(&mut self, msg: PresenceMessage, now: Instant) {
        self.outbox.push(SyncMessage::Presence(msg));
        self.presence_sent_at = Some(now);
    }

    pub fn acquire_lease(&mut self, element: ElementId) -> Result<(), SyncError> {
        self.require_live()?;
        self.outbox.push(SyncMessage::LeaseAcquire { element });
        Ok(())
    }

    pub fn release_lease(&mut self, element: ElementId) -> Result<(), SyncError> {
        self.require_live()?;
        self.outbox.push(SyncMessage::LeaseRelease { element });
        Ok(())
    }

    /// Ask for a full snapshot from the current cursor.
    pub fn request_resync(&mut self) -> Result<(), SyncError> {
        self.require_live()?;
        self.request_catch_up(true);
        Ok(())
    }

    /// Say goodbye to the relay.
    pub fn leave(&mut self) {
        if self.state == LinkState::Live {
            self.outbox.push(SyncMessage::Leave {
                site_id: self.site_id(),
            });
        }
    }

    fn require_live(&self) -> Result<(), SyncError> {
        match self.state {
            LinkState::Live => Ok(()),
            _ => Err(SyncError::TransportDisconnected),
        }
    }

    // ─── Maintenance ────────────────────────────────────────────────

    /// Dependency timeouts, presence expiry and throttled presence.
    pub fn tick(&mut self, now: Instant) {
        let gaps = self.replica.expire_pending(now);
        if !gaps.is_empty() && self.state == LinkState::Live && !self.catching_up {
            self.request_catch_up(true);
        }

        let timeout = self.replica.config().presence_timeout;
        self.presence.sweep(now, timeout);

        if self.state != LinkState::Live {
            return;
        }
        if let Some(out) = self.throttle.flush(now) {
            self.send_presence(out, now);
        } else if let Some(local) = &self.local_presence {
            // Refresh well inside the peers' timeout.
            let due = self
                .presence_sent_at
                .map_or(true, |at| now.saturating_duration_since(at) >= timeout / 3);
            if due {
                let refresh = local.refreshed();
                self.send_presence(refresh, now);
            }
        }
    }

    pub fn take_outbox(&mut self) -> Vec<SyncMessage> {
        std::mem::take(&mut self.outbox)
    }

    // ─── Queries ────────────────────────────────────────────────────

    pub fn list_elements(&self, include_tombstoned: bool) -> Vec<Element> {
        self.replica.list_elements(include_tombstoned)
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.replica.get(id)
    }

    pub fn presence(&self) -> Vec<PresenceRecord> {
        self.presence.presence()
    }

    pub fn replica(&self) -> &DocumentReplica {
        &self.replica
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppliedOp> {
        self.replica.subscribe()
    }

    pub fn site_id(&self) -> SiteId {
        self.replica.site_id()
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Operations waiting for a connection, overflowed ones included.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn config(&self) -> &EngineConfig {
        self.replica.config()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    Apply {
        kind: OpKind,
        target: ElementId,
        reply: Reply<Operation>,
    },
    Presence(PresenceMessage),
    AcquireLease {
        element: ElementId,
        reply: Reply<()>,
    },
    ReleaseLease {
        element: ElementId,
        reply: Reply<()>,
    },
    Resync(Reply<()>),
    Inspect(Box<dyn FnOnce(&SyncEngine) + Send>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable client of a running engine task.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
    lease_reply_timeout: Duration,
    site_id: SiteId,
    doc_id: DocumentId,
}

/// Run `engine` on its own task, fed by `transport`.
pub fn spawn_engine<T: SyncTransport>(engine: SyncEngine, transport: T) -> Result<EngineHandle, SyncError> {
    let events = transport.take_receiver().ok_or(TransportError::Closed)?;
    let (commands, rx) = mpsc::unbounded_channel();
    let handle = EngineHandle {
        commands,
        events: engine.events.clone(),
        lease_reply_timeout: engine.config().lease_reply_timeout,
        site_id: engine.site_id(),
        doc_id: engine.doc_id(),
    };
    tokio::spawn(run(engine, transport, events, rx));
    Ok(handle)
}

async fn run<T: SyncTransport>(
    mut engine: SyncEngine,
    transport: T,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let period = engine
        .config()
        .maintenance_interval
        .min(engine.config().presence_interval())
        .max(Duration::from_millis(1));
    let mut maintenance = tokio::time::interval(period);
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut transport_open = true;

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Shutdown(done)) => {
                        engine.leave();
                        flush(&mut engine, &transport);
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => execute(&mut engine, command),
                    None => {
                        engine.leave();
                        flush(&mut engine, &transport);
                        break;
                    }
                }
            }

            event = events.recv(), if transport_open => {
                match event {
                    Some(TransportEvent::Connected) => engine.on_connected(),
                    Some(TransportEvent::Message(msg)) => engine.handle_message(msg, Instant::now()),
                    Some(TransportEvent::Disconnected) => engine.on_disconnected(),
                    None => {
                        log::warn!("Transport for {} went away", engine.doc_id());
                        transport_open = false;
                        engine.on_disconnected();
                    }
                }
            }

            _ = maintenance.tick() => engine.tick(Instant::now()),
        }

        flush(&mut engine, &transport);
    }

    log::info!("Sync engine for {} stopped", engine.doc_id());
}

fn execute(engine: &mut SyncEngine, command: Command) {
    match command {
        Command::Apply { kind, target, reply } => {
            let _ = reply.send(engine.apply_local(kind, target));
        }
        Command::Presence(msg) => engine.update_presence(msg, Instant::now()),
        Command::AcquireLease { element, reply } => {
            let _ = reply.send(engine.acquire_lease(element));
        }
        Command::ReleaseLease { element, reply } => {
            let _ = reply.send(engine.release_lease(element));
        }
        Command::Resync(reply) => {
            let _ = reply.send(engine.request_resync());
        }
        Command::Inspect(f) => f(&*engine),
        Command::Shutdown(_) => {}
    }
}

fn flush<T: SyncTransport>(engine: &mut SyncEngine, transport: &T) {
    for msg in engine.take_outbox() {
        let sent = match msg {
            SyncMessage::CatchUp { since, full: true } => transport.request_snapshot(since),
            other => transport.send(other),
        };
        if let Err(e) = sent {
            // Unacknowledged operations are requeued on the Disconnected event.
            log::debug!("Dropping outgoing message: {e}");
        }
    }
}

impl EngineHandle {
    pub async fn insert<I, K>(&self, fields: I) -> Result<Operation, SyncError>
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<FieldName>,
    {
        self.apply_local(OpKind::insert(fields), ElementId::new()).await
    }

    pub async fn update(
        &self,
        target: ElementId,
        field: impl Into<FieldName>,
        value: impl Into<FieldValue>,
    ) -> Result<Operation, SyncError> {
        self.apply_local(OpKind::update(field, value), target).await
    }

    pub async fn delete(&self, target: ElementId) -> Result<Operation, SyncError> {
        self.apply_local(OpKind::Delete, target).await
    }

    pub async fn apply_local(&self, kind: OpKind, target: ElementId) -> Result<Operation, SyncError> {
        self.call(|reply| Command::Apply { kind, target, reply }).await
    }

    /// Fire and forget; presence is lossy.
    pub fn update_presence(&self, msg: PresenceMessage) -> Result<(), SyncError> {
        self.commands
            .send(Command::Presence(msg))
            .map_err(|_| SyncError::EngineClosed)
    }

    /// Ask the relay for a lease and wait for its answer.
    ///
    /// Returns how long the lease lasts. A lost race is
    /// [`SyncError::LeaseContention`] naming the holder; the same answer is
    /// also published on the event stream.
    pub async fn acquire_lease(&self, element: ElementId) -> Result<Duration, SyncError> {
        let mut events = self.events.subscribe();
        self.call(|reply| Command::AcquireLease { element, reply }).await?;

        let answer = async {
            loop {
                match events.recv().await {
                    Ok(SyncEvent::LeaseGranted { element: granted, expires_in }) if granted == element => {
                        return Ok(expires_in);
                    }
                    Ok(SyncEvent::LeaseContention { element: contended, holder }) if contended == element => {
                        return Err(SyncError::LeaseContention { element, holder });
                    }
                    Ok(SyncEvent::TransportDisconnected) => return Err(SyncError::TransportDisconnected),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("Lease waiter for {element} skipped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(SyncError::EngineClosed),
                }
            }
        };
        tokio::time::timeout(self.lease_reply_timeout, answer)
            .await
            .map_err(|_| SyncError::LeaseTimeout(element))?
    }

    pub async fn release_lease(&self, element: ElementId) -> Result<(), SyncError> {
        self.call(|reply| Command::ReleaseLease { element, reply }).await
    }

    pub async fn request_resync(&self) -> Result<(), SyncError> {
        self.call(Command::Resync).await
    }

    /// Run `f` against the engine state on the engine task.
    pub async fn inspect<R, F>(&self, f: F) -> Result<R, SyncError>
    where
        R: Send + 'static,
        F: FnOnce(&SyncEngine) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let command = Command::Inspect(Box::new(move |engine: &SyncEngine| {
            let _ = tx.send(f(engine));
        }));
        self.commands.send(command).map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    pub async fn list_elements(&self, include_tombstoned: bool) -> Result<Vec<Element>, SyncError> {
        self.inspect(move |engine| engine.list_elements(include_tombstoned)).await
    }

    pub async fn get(&self, id: ElementId) -> Result<Option<Element>, SyncError> {
        self.inspect(move |engine| engine.get(&id).cloned()).await
    }

    pub async fn presence(&self) -> Result<Vec<PresenceRecord>, SyncError> {
        self.inspect(|engine| engine.presence()).await
    }

    pub async fn cursor(&self) -> Result<u64, SyncError> {
        self.inspect(|engine| engine.cursor()).await
    }

    pub async fn state(&self) -> Result<LinkState, SyncError> {
        self.inspect(|engine| engine.state()).await
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    /// Send `Leave` if connected and stop the engine task.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(tx))
            .map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)?
    }
}
