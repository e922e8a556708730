//! The document replica: a state-based view driven by operation-based
//! last-writer-wins CRDT rules.
//!
//! ```text
//!  apply_local ──► clock.tick ──► integrate ──► subscribers (Local)
//!                                    ▲
//!  apply_remote ─► dedup ─► deps? ───┤ yes
//!                             │ no   │
//!                             ▼      │
//!                          pending ──┘ (released when the dependency lands)
//! ```
//!
//! Every rule here is commutative and idempotent: `elements` is always the
//! result of replaying `seen_ops` in any order that respects causal deps.
//! The replica is a plain `&mut self` state machine; callers serialise
//! access (see `engine` for the actor that owns one).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::clock::{LamportClock, LamportTimestamp, SiteId};
use crate::config::EngineConfig;
use crate::conflict::ConflictDetector;
use crate::element::{Element, ElementId, FieldName, FieldValue};
use crate::error::SyncError;
use crate::events::SyncEvent;
use crate::operation::{AppliedOp, OpId, OpKind, Operation, Origin};
use crate::oplog::{LogStatus, OperationLog};

/// Something a buffered operation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// An explicit causal dependency.
    Op(OpId),
    /// The target element itself (Update/Delete that names no Insert).
    Element(ElementId),
}

/// Outcome of [`DocumentReplica::apply_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    /// Already seen; nothing changed.
    Duplicate,
    /// Waiting for the listed dependencies.
    Buffered { missing: Vec<Dependency> },
    /// Applied, along with `released` previously buffered operations.
    Applied { released: usize },
}

/// Full-state resync message.
///
/// Carries timestamps next to values so that merging is the same
/// field-by-field LWW rule as applying operations. Coverage needs no op
/// list: an operation is reflected when the snapshot's timestamp for what
/// it writes is at least its own, and each element names its Insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub as_of: LamportTimestamp,
    pub elements: Vec<Element>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            as_of: LamportTimestamp::new(0, SiteId::nil()),
            elements: Vec::new(),
        }
    }
}

/// Counts reported by [`DocumentReplica::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub changed_fields: usize,
    pub superseded: usize,
    pub released: usize,
}

/// A pending operation that outlived the dependency timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityGap {
    pub op_id: OpId,
    pub missing: Vec<Dependency>,
    pub waited: Duration,
}

#[derive(Debug)]
struct PendingOp {
    op: Operation,
    missing: HashSet<Dependency>,
    received_at: Instant,
    gap_reported: bool,
}

pub struct DocumentReplica {
    clock: LamportClock,
    config: EngineConfig,
    elements: BTreeMap<ElementId, Element>,
    seen_ops: HashSet<OpId>,
    log: OperationLog,
    pending: HashMap<OpId, PendingOp>,
    waiting_on: HashMap<Dependency, Vec<OpId>>,
    detector: ConflictDetector,
    /// Off while replaying history; replayed edits are not conflicts.
    classifying: bool,
    ops_tx: broadcast::Sender<AppliedOp>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl DocumentReplica {
    pub fn new(site_id: SiteId, config: EngineConfig) -> Self {
        let (ops_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            clock: LamportClock::new(site_id),
            detector: ConflictDetector::new(&config),
            config,
            elements: BTreeMap::new(),
            seen_ops: HashSet::new(),
            log: OperationLog::new(),
            pending: HashMap::new(),
            waiting_on: HashMap::new(),
            classifying: true,
            ops_tx,
            events_tx,
        }
    }

    /// Rebuild a replica from a persisted operation history.
    pub fn replay<I>(site_id: SiteId, config: EngineConfig, ops: I) -> Self
    where
        I: IntoIterator<Item = Operation>,
    {
        let mut replica = Self::new(site_id, config);
        let now = Instant::now();
        for op in ops {
            replica.apply_history_at(op, now);
        }
        let max_counter = replica.log.max_counter();
        replica.clock.restore(max_counter);
        replica
    }

    // ─── Local edits ────────────────────────────────────────────────

    /// Stamp, apply and return a local operation.
    ///
    /// Never waits on the network. Update/Delete depend on the target's Insert.
    pub fn apply_local(&mut self, kind: OpKind, target: ElementId) -> Result<Operation, SyncError> {
        self.apply_local_at(kind, target, Instant::now())
    }

    pub fn apply_local_at(
        &mut self,
        kind: OpKind,
        target: ElementId,
        now: Instant,
    ) -> Result<Operation, SyncError> {
        let (causal_deps, observed) = match &kind {
            OpKind::Insert { .. } => {
                if self.elements.contains_key(&target) {
                    return Err(SyncError::ElementExists(target));
                }
                (Vec::new(), None)
            }
            OpKind::Update { .. } | OpKind::Delete => {
                let element = self
                    .elements
                    .get(&target)
                    .ok_or(SyncError::UnknownElement(target))?;
                (vec![element.inserted_by], element.max_timestamp())
            }
        };

        let timestamp = self.clock.tick();
        let op = Operation::new(timestamp, target, kind, causal_deps).with_observed(observed);
        self.integrate(op.clone(), Origin::Local, now);
        Ok(op)
    }

    /// Insert a new element under a fresh id.
    pub fn insert<I, K>(&mut self, fields: I) -> Result<Operation, SyncError>
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<FieldName>,
    {
        self.apply_local(OpKind::insert(fields), ElementId::new())
    }

    // ─── Remote operations ──────────────────────────────────────────

    /// Apply an operation received from another replica.
    ///
    /// Idempotent; never rejects. Operations with unmet dependencies are
    /// buffered and replayed as soon as the dependency lands.
    pub fn apply_remote(&mut self, op: Operation) -> ApplyResult {
        self.apply_remote_at(op, Instant::now())
    }

    pub fn apply_remote_at(&mut self, op: Operation, now: Instant) -> ApplyResult {
        if self.log.contains(&op.op_id) || self.seen_ops.contains(&op.op_id) {
            log::trace!("Duplicate operation {}", op.op_id);
            return ApplyResult::Duplicate;
        }

        // Receiving any operation advances local time.
        self.clock.observe(op.timestamp);

        let missing = self.missing_dependencies(&op);
        if !missing.is_empty() {
            log::debug!(
                "Buffering {} {} on {}: {} unmet dependencies",
                op.kind.name(),
                op.op_id,
                op.target,
                missing.len()
            );
            for dep in &missing {
                self.waiting_on.entry(*dep).or_default().push(op.op_id);
            }
            self.log.append(op.clone(), LogStatus::Pending);
            let list = missing.iter().copied().collect();
            self.pending.insert(
                op.op_id,
                PendingOp {
                    op,
                    missing,
                    received_at: now,
                    gap_reported: false,
                },
            );
            return ApplyResult::Buffered { missing: list };
        }

        let ready = self.integrate(op, Origin::Remote, now);
        let released = self.release(ready, now);
        ApplyResult::Applied { released }
    }

    /// Apply an operation replayed from history (a relay log tail or a
    /// persisted log). Same rules as [`apply_remote_at`](Self::apply_remote_at),
    /// but nothing is classified as a conflict.
    pub fn apply_history_at(&mut self, op: Operation, now: Instant) -> ApplyResult {
        let classifying = std::mem::replace(&mut self.classifying, false);
        let result = self.apply_remote_at(op, now);
        self.classifying = classifying;
        result
    }

    fn missing_dependencies(&self, op: &Operation) -> HashSet<Dependency> {
        let target_insert = self.elements.get(&op.target).map(|e| e.inserted_by);
        let mut missing: HashSet<Dependency> = op
            .causal_deps
            .iter()
            .filter(|dep| !self.seen_ops.contains(*dep) && target_insert != Some(**dep))
            .map(|dep| Dependency::Op(*dep))
            .collect();
        let needs_target = !matches!(op.kind, OpKind::Insert { .. });
        if needs_target && missing.is_empty() && !self.elements.contains_key(&op.target) {
            missing.insert(Dependency::Element(op.target));
        }
        missing
    }

    /// Apply an operation whose dependencies are met. Returns the
    /// dependencies this application satisfies.
    fn integrate(&mut self, op: Operation, origin: Origin, now: Instant) -> Vec<Dependency> {
        let mut satisfied = vec![Dependency::Op(op.op_id)];

        match &op.kind {
            OpKind::Insert { fields } => {
                if self.elements.contains_key(&op.target) {
                    // True id collisions are out of scope; the second Insert is swallowed.
                    log::debug!("Insert {} for existing element {} ignored", op.op_id, op.target);
                } else {
                    let element =
                        Element::inserted(op.target, fields.clone(), op.timestamp, op.op_id);
                    self.elements.insert(op.target, element);
                    satisfied.push(Dependency::Element(op.target));
                }
            }
            OpKind::Update { field, value } => {
                if let Some(element) = self.elements.get_mut(&op.target) {
                    element.write_field(field, value.clone(), op.timestamp);
                }
            }
            OpKind::Delete => {
                if let Some(element) = self.elements.get_mut(&op.target) {
                    element.write_tombstone(true, op.timestamp);
                }
            }
        }

        self.seen_ops.insert(op.op_id);
        if self.log.status(&op.op_id).is_some() {
            self.log.set_status(&op.op_id, LogStatus::Applied);
        } else {
            self.log.append(op.clone(), LogStatus::Applied);
        }

        if !self.classifying {
            self.detector.record(&op, &self.elements, now);
            let _ = self.ops_tx.send(AppliedOp { op, origin });
            return satisfied;
        }

        for conflict in self.detector.observe(&op, &self.elements, now) {
            log::debug!(
                "Conflict on {}: {:?} ({} beats {})",
                conflict.element,
                conflict.kind,
                conflict.winning_op,
                conflict.losing_op
            );
            let _ = self.events_tx.send(SyncEvent::ConflictDetected(conflict));
        }

        let _ = self.ops_tx.send(AppliedOp { op, origin });
        satisfied
    }

    /// Replay buffered operations unblocked by `ready`, transitively.
    fn release(&mut self, ready: Vec<Dependency>, now: Instant) -> usize {
        let mut queue: VecDeque<Dependency> = ready.into();
        let mut released = 0;

        while let Some(dep) = queue.pop_front() {
            let Some(waiters) = self.waiting_on.remove(&dep) else {
                continue;
            };
            for waiter in waiters {
                let unblocked = match self.pending.get_mut(&waiter) {
                    Some(p) => {
                        p.missing.remove(&dep);
                        p.missing.is_empty()
                    }
                    None => false,
                };
                if !unblocked {
                    continue;
                }
                if let Some(pending) = self.pending.remove(&waiter) {
                    // Causal deps are met, but an Update may still lack its target.
                    let still_missing = self.missing_dependencies(&pending.op);
                    if !still_missing.is_empty() {
                        for dep in &still_missing {
                            self.waiting_on.entry(*dep).or_default().push(waiter);
                        }
                        self.pending.insert(
                            waiter,
                            PendingOp {
                                missing: still_missing,
                                ..pending
                            },
                        );
                        continue;
                    }
                    queue.extend(self.integrate(pending.op, Origin::Remote, now));
                    released += 1;
                }
            }
        }

        if released > 0 {
            log::debug!("Released {released} buffered operations");
        }
        released
    }

    // ─── Snapshots ──────────────────────────────────────────────────

    /// Field-by-field LWW merge of a full snapshot.
    ///
    /// Buffered operations the merged state already reflects are superseded;
    /// buffered operations waiting on a snapshot element are released.
    pub fn merge(&mut self, snapshot: &Snapshot) -> MergeOutcome {
        self.merge_at(snapshot, Instant::now())
    }

    pub fn merge_at(&mut self, snapshot: &Snapshot, now: Instant) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut ready = Vec::new();

        for incoming in &snapshot.elements {
            match self.elements.get_mut(&incoming.id) {
                Some(existing) => outcome.changed_fields += existing.merge_from(incoming),
                None => {
                    outcome.changed_fields += incoming.field_timestamps.len()
                        + usize::from(incoming.tombstone_timestamp.is_some());
                    self.elements.insert(incoming.id, incoming.clone());
                    ready.push(Dependency::Element(incoming.id));
                }
            }
            if self.seen_ops.insert(incoming.inserted_by) {
                ready.push(Dependency::Op(incoming.inserted_by));
            }
        }

        self.clock.observe(snapshot.as_of);

        let covered: Vec<OpId> = self
            .pending
            .values()
            .filter(|p| self.reflects(&p.op))
            .map(|p| p.op.op_id)
            .collect();
        for op_id in covered {
            if let Some(pending) = self.pending.remove(&op_id) {
                self.unlink(op_id, &pending.missing);
                self.log.set_status(&op_id, LogStatus::Superseded);
                self.seen_ops.insert(op_id);
                ready.push(Dependency::Op(op_id));
                outcome.superseded += 1;
            }
        }

        let classifying = std::mem::replace(&mut self.classifying, false);
        outcome.released = self.release(ready, now);
        self.classifying = classifying;

        log::info!(
            "Merged snapshot as of {}: {} fields changed, {} superseded, {} released",
            snapshot.as_of,
            outcome.changed_fields,
            outcome.superseded,
            outcome.released
        );
        let _ = self.events_tx.send(SyncEvent::SnapshotMerged {
            changed_fields: outcome.changed_fields,
            superseded: outcome.superseded,
        });
        outcome
    }

    /// Snapshot of the current state, suitable for [`merge`](Self::merge).
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            as_of: self.clock.current(),
            elements: self.elements.values().cloned().collect(),
        }
    }

    /// Current state already holds `op`'s effect or something newer.
    fn reflects(&self, op: &Operation) -> bool {
        let Some(element) = self.elements.get(&op.target) else {
            return false;
        };
        match &op.kind {
            OpKind::Insert { .. } => element.inserted_by == op.op_id,
            OpKind::Update { field, .. } => element
                .field_timestamps
                .get(field)
                .map_or(false, |ts| *ts >= op.timestamp),
            OpKind::Delete => element
                .tombstone_timestamp
                .map_or(false, |ts| ts >= op.timestamp),
        }
    }

    fn unlink(&mut self, op_id: OpId, missing: &HashSet<Dependency>) {
        for dep in missing {
            if let Some(waiters) = self.waiting_on.get_mut(dep) {
                waiters.retain(|w| *w != op_id);
                if waiters.is_empty() {
                    self.waiting_on.remove(dep);
                }
            }
        }
    }

    // ─── Dependency timeouts ────────────────────────────────────────

    /// Report buffered operations that outlived the dependency timeout.
    ///
    /// Each one is reported once; it stays buffered so a late dependency or
    /// a superseding snapshot can still resolve it.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<IntegrityGap> {
        self.detector.prune(now);

        let timeout = self.config.dependency_timeout;
        let mut gaps = Vec::new();
        for pending in self.pending.values_mut() {
            let waited = now.saturating_duration_since(pending.received_at);
            if pending.gap_reported || waited <= timeout {
                continue;
            }
            pending.gap_reported = true;
            let mut missing: Vec<Dependency> = pending.missing.iter().copied().collect();
            missing.sort_by_key(|d| match d {
                Dependency::Op(id) => id.as_uuid(),
                Dependency::Element(id) => id.as_uuid(),
            });
            gaps.push(IntegrityGap {
                op_id: pending.op.op_id,
                missing,
                waited,
            });
        }

        for gap in &gaps {
            log::warn!(
                "Integrity gap: {} waited {:?} for {} dependencies",
                gap.op_id,
                gap.waited,
                gap.missing.len()
            );
            let _ = self.events_tx.send(SyncEvent::IntegrityGap {
                op_id: gap.op_id,
                missing: gap.missing.clone(),
                waited: gap.waited,
            });
        }
        gaps
    }

    // ─── Queries ────────────────────────────────────────────────────

    /// All elements ordered by id, optionally including tombstoned ones.
    pub fn list_elements(&self, include_tombstoned: bool) -> Vec<Element> {
        self.elements
            .values()
            .filter(|e| include_tombstoned || !e.tombstoned)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Stream of every operation integrated from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AppliedOp> {
        self.ops_tx.subscribe()
    }

    /// Stream of conflicts, gaps and merge notifications.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events_tx.clone()
    }

    pub fn has_seen(&self, op_id: &OpId) -> bool {
        self.seen_ops.contains(op_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn site_id(&self) -> SiteId {
        self.clock.site_id()
    }

    pub fn now(&self) -> LamportTimestamp {
        self.clock.current()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(n: u128) -> SiteId {
        SiteId::from_u128(n)
    }

    fn replica(n: u128) -> DocumentReplica {
        DocumentReplica::new(site(n), EngineConfig::default())
    }

    fn text(replica: &DocumentReplica, id: ElementId, field: &str) -> Option<String> {
        replica
            .get(&id)
            .and_then(|e| e.get(field))
            .and_then(|v| v.as_text())
            .map(str::to_string)
    }

    #[test]
    fn test_local_insert_and_update() {
        let mut a = replica(1);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        let update = a.apply_local(OpKind::update("value", "12k"), insert.target).unwrap();

        assert_eq!(update.causal_deps, vec![insert.op_id]);
        assert_eq!(text(&a, insert.target, "value").as_deref(), Some("12k"));
        assert_eq!(a.log().len(), 2);
    }

    #[test]
    fn test_local_update_of_unknown_element() {
        let mut a = replica(1);
        let err = a.apply_local(OpKind::Delete, ElementId::new()).unwrap_err();
        assert!(matches!(err, SyncError::UnknownElement(_)));
    }

    #[test]
    fn test_local_insert_of_existing_id() {
        let mut a = replica(1);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        let err = a
            .apply_local(OpKind::insert([("value", FieldValue::text("1k"))]), insert.target)
            .unwrap_err();
        assert!(matches!(err, SyncError::ElementExists(_)));
    }

    #[test]
    fn test_apply_remote_is_idempotent() {
        let mut a = replica(1);
        let mut b = replica(2);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();

        assert_eq!(b.apply_remote(insert.clone()), ApplyResult::Applied { released: 0 });
        let once = b.list_elements(true);
        assert_eq!(b.apply_remote(insert), ApplyResult::Duplicate);
        assert_eq!(b.list_elements(true), once);
        assert_eq!(b.log().len(), 1);
    }

    #[test]
    fn test_remote_advances_clock() {
        let mut a = replica(1);
        let mut b = replica(2);
        for _ in 0..5 {
            a.insert([("n", FieldValue::Int(1))]).unwrap();
        }
        let last = a.insert([("n", FieldValue::Int(2))]).unwrap();
        b.apply_remote(last.clone());
        assert!(b.now().counter > last.timestamp.counter);
    }

    #[test]
    fn test_update_before_insert_is_buffered() {
        let mut a = replica(1);
        let mut b = replica(2);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        let update = a.apply_local(OpKind::update("value", "12k"), insert.target).unwrap();

        let result = b.apply_remote(update);
        assert_eq!(
            result,
            ApplyResult::Buffered {
                missing: vec![Dependency::Op(insert.op_id)]
            }
        );
        assert!(b.get(&insert.target).is_none());
        assert_eq!(b.pending_count(), 1);

        assert_eq!(b.apply_remote(insert.clone()), ApplyResult::Applied { released: 1 });
        assert_eq!(text(&b, insert.target, "value").as_deref(), Some("12k"));
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn test_transitive_release() {
        let mut a = replica(1);
        let mut b = replica(2);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        let u1 = a.apply_local(OpKind::update("value", "12k"), insert.target).unwrap();
        // Hand-built chain: u2 depends on u1.
        let mut u2 = a.apply_local(OpKind::update("tolerance", "1%"), insert.target).unwrap();
        u2.causal_deps = vec![u1.op_id];

        assert!(matches!(b.apply_remote(u2), ApplyResult::Buffered { .. }));
        assert!(matches!(b.apply_remote(u1), ApplyResult::Buffered { .. }));
        assert_eq!(b.apply_remote(insert.clone()), ApplyResult::Applied { released: 2 });
        assert_eq!(text(&b, insert.target, "tolerance").as_deref(), Some("1%"));
    }

    #[test]
    fn test_update_without_deps_waits_for_target() {
        let mut a = replica(1);
        let mut b = replica(2);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        let mut update = a.apply_local(OpKind::update("value", "47k"), insert.target).unwrap();
        update.causal_deps.clear();

        assert_eq!(
            b.apply_remote(update),
            ApplyResult::Buffered {
                missing: vec![Dependency::Element(insert.target)]
            }
        );
        assert_eq!(b.apply_remote(insert.clone()), ApplyResult::Applied { released: 1 });
        assert_eq!(text(&b, insert.target, "value").as_deref(), Some("47k"));
    }

    #[test]
    fn test_lww_independent_of_arrival_order() {
        let mut origin = replica(1);
        let insert = origin.insert([("value", FieldValue::text("10k"))]).unwrap();
        let e = insert.target;

        let mut a = replica(1);
        let mut b = replica(2);
        a.apply_remote(insert.clone());
        b.apply_remote(insert.clone());
        let ua = a.apply_local(OpKind::update("value", "12k"), e).unwrap();
        let ub = b.apply_local(OpKind::update("value", "15k"), e).unwrap();
        assert_eq!(ua.timestamp.counter, ub.timestamp.counter);

        a.apply_remote(ub);
        b.apply_remote(ua);
        assert_eq!(text(&a, e, "value").as_deref(), Some("15k"));
        assert_eq!(text(&b, e, "value").as_deref(), Some("15k"));
    }

    #[test]
    fn test_concurrent_edits_to_different_fields_both_survive() {
        let mut a = replica(1);
        let mut b = replica(2);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        b.apply_remote(insert.clone());

        let ua = a.apply_local(OpKind::update("value", "12k"), insert.target).unwrap();
        let ub = b
            .apply_local(OpKind::update("position", FieldValue::point(5.0, 5.0)), insert.target)
            .unwrap();
        a.apply_remote(ub);
        b.apply_remote(ua);

        assert_eq!(a.list_elements(true), b.list_elements(true));
        let e = a.get(&insert.target).unwrap();
        assert_eq!(e.get("value").and_then(|v| v.as_text()), Some("12k"));
        assert_eq!(e.get("position").and_then(|v| v.as_point()), Some((5.0, 5.0)));
    }

    #[test]
    fn test_delete_keeps_concurrent_field_values() {
        let mut a = replica(1);
        let mut b = replica(2);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        b.apply_remote(insert.clone());

        let moved = b
            .apply_local(OpKind::update("position", FieldValue::point(1.0, 2.0)), insert.target)
            .unwrap();
        a.apply_local(OpKind::update("value", "11k"), insert.target).unwrap();
        a.apply_local(OpKind::update("value", "12k"), insert.target).unwrap();
        let deleted = a.apply_local(OpKind::Delete, insert.target).unwrap();
        assert!(deleted.timestamp > moved.timestamp);

        a.apply_remote(moved);
        let e = a.get(&insert.target).unwrap();
        assert!(e.tombstoned);
        assert_eq!(e.get("position").and_then(|v| v.as_point()), Some((1.0, 2.0)));
        assert!(a.list_elements(false).is_empty());
        assert_eq!(a.list_elements(true).len(), 1);
    }

    #[test]
    fn test_second_insert_of_same_id_is_swallowed() {
        let mut a = replica(1);
        let mut b = replica(2);
        let id = ElementId::new();
        let first = a.apply_local(OpKind::insert([("value", FieldValue::text("A"))]), id).unwrap();
        let second = b.apply_local(OpKind::insert([("value", FieldValue::text("B"))]), id).unwrap();

        a.apply_remote(second.clone());
        assert_eq!(text(&a, id, "value").as_deref(), Some("A"));
        assert!(a.has_seen(&second.op_id));
        assert!(a.has_seen(&first.op_id));
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let mut a = replica(1);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        a.apply_local(OpKind::update("value", "22k"), insert.target).unwrap();
        a.apply_local(OpKind::Delete, insert.target).unwrap();

        let ops: Vec<Operation> = a.log().iter().map(|e| e.op.clone()).collect::<Vec<_>>().into_iter().rev().collect();
        let rebuilt = DocumentReplica::replay(site(1), EngineConfig::default(), ops);
        assert_eq!(rebuilt.list_elements(true), a.list_elements(true));
        assert!(rebuilt.now().counter >= a.now().counter);
    }

    #[test]
    fn test_merge_snapshot_into_empty_replica() {
        let mut a = replica(1);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        a.apply_local(OpKind::update("value", "33k"), insert.target).unwrap();

        let mut joiner = replica(3);
        let outcome = joiner.merge(&a.snapshot());
        assert!(outcome.changed_fields >= 1);
        assert_eq!(joiner.list_elements(true), a.list_elements(true));
        assert!(joiner.has_seen(&insert.op_id));
        assert!(joiner.now() >= a.now());

        // An edit made after the snapshot applies directly: its dependency is covered.
        let later = a.apply_local(OpKind::update("value", "47k"), insert.target).unwrap();
        assert_eq!(joiner.apply_remote(later), ApplyResult::Applied { released: 0 });
        assert_eq!(text(&joiner, insert.target, "value").as_deref(), Some("47k"));
    }

    #[test]
    fn test_merge_keeps_newer_local_fields() {
        let mut a = replica(1);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        let mut b = replica(2);
        b.apply_remote(insert.clone());
        let snapshot = a.snapshot();

        b.apply_local(OpKind::update("value", "68k"), insert.target).unwrap();
        let outcome = b.merge(&snapshot);
        assert_eq!(outcome.changed_fields, 0);
        assert_eq!(text(&b, insert.target, "value").as_deref(), Some("68k"));
    }

    #[test]
    fn test_merge_supersedes_and_releases_pending() {
        let mut a = replica(1);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        let u1 = a.apply_local(OpKind::update("value", "12k"), insert.target).unwrap();
        let snapshot = a.snapshot();
        let u2 = a.apply_local(OpKind::update("value", "15k"), insert.target).unwrap();

        let mut b = replica(2);
        b.apply_remote(u1.clone());
        b.apply_remote(u2);
        assert_eq!(b.pending_count(), 2);

        let outcome = b.merge(&snapshot);
        assert_eq!(outcome.superseded, 1);
        assert_eq!(outcome.released, 1);
        assert_eq!(b.pending_count(), 0);
        assert!(b.waiting_on.is_empty());
        assert_eq!(b.log().status(&u1.op_id), Some(LogStatus::Superseded));
        assert_eq!(text(&b, insert.target, "value").as_deref(), Some("15k"));
    }

    #[test]
    fn test_expire_pending_reports_once() {
        let mut config = EngineConfig::default();
        config.dependency_timeout = Duration::from_millis(100);
        let mut a = replica(1);
        let mut b = DocumentReplica::new(site(2), config);
        let mut events = b.events();

        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        let update = a.apply_local(OpKind::update("value", "1M"), insert.target).unwrap();
        let t0 = Instant::now();
        b.apply_remote_at(update.clone(), t0);

        assert!(b.expire_pending(t0 + Duration::from_millis(50)).is_empty());
        let gaps = b.expire_pending(t0 + Duration::from_millis(150));
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].op_id, update.op_id);
        assert!(b.expire_pending(t0 + Duration::from_millis(300)).is_empty());
        assert_eq!(b.pending_count(), 1);

        match events.try_recv() {
            Ok(SyncEvent::IntegrityGap { op_id, missing, .. }) => {
                assert_eq!(op_id, update.op_id);
                assert_eq!(missing, vec![Dependency::Op(insert.op_id)]);
            }
            other => panic!("expected IntegrityGap, got {other:?}"),
        }

        // The late dependency still resolves it.
        b.apply_remote(insert);
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn test_subscribe_reports_origin() {
        let mut a = replica(1);
        let mut b = replica(2);
        let mut stream = b.subscribe();

        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        b.apply_remote(insert.clone());
        b.apply_local(OpKind::Delete, insert.target).unwrap();

        let first = stream.try_recv().unwrap();
        assert_eq!(first.origin, Origin::Remote);
        assert_eq!(first.op.op_id, insert.op_id);
        let second = stream.try_recv().unwrap();
        assert_eq!(second.origin, Origin::Local);
        assert!(second.op.kind.is_structural());
    }

    #[test]
    fn test_conflict_event_emitted() {
        let mut a = replica(1);
        let mut b = replica(2);
        let mut events = a.events();
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        b.apply_remote(insert.clone());

        let ub = b.apply_local(OpKind::update("value", "15k"), insert.target).unwrap();
        let ua = a.apply_local(OpKind::update("value", "12k"), insert.target).unwrap();
        a.apply_remote(ub.clone());

        let conflict = std::iter::from_fn(|| events.try_recv().ok())
            .find_map(|e| match e {
                SyncEvent::ConflictDetected(c) if c.losing_op == ua.op_id => Some(c),
                _ => None,
            })
            .expect("conflict between ua and ub");
        assert_eq!(conflict.winning_op, ub.op_id);
        assert_eq!(text(&a, insert.target, "value").as_deref(), Some("15k"));
    }

    #[test]
    fn test_gap_on_missing_target_names_the_element() {
        let mut config = EngineConfig::default();
        config.dependency_timeout = Duration::from_millis(100);
        let mut a = replica(1);
        let mut b = DocumentReplica::new(site(2), config);
        let mut events = b.events();

        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        let mut update = a.apply_local(OpKind::update("value", "2M"), insert.target).unwrap();
        update.causal_deps.clear();
        let t0 = Instant::now();
        b.apply_remote_at(update.clone(), t0);

        let gaps = b.expire_pending(t0 + Duration::from_millis(150));
        assert_eq!(gaps[0].missing, vec![Dependency::Element(insert.target)]);
        match events.try_recv() {
            Ok(SyncEvent::IntegrityGap { missing, .. }) => {
                assert_eq!(missing, vec![Dependency::Element(insert.target)]);
            }
            other => panic!("expected IntegrityGap, got {other:?}"),
        }
    }

    #[test]
    fn test_causally_ordered_edits_are_not_conflicts() {
        let (a, b) = (site(1), site(2));
        let e = ElementId::from_u128(1);
        let insert = Operation::new(
            LamportTimestamp::new(1, a),
            e,
            OpKind::insert([("value", FieldValue::text("0"))]),
            Vec::new(),
        );
        let mut history = vec![insert.clone()];
        for i in 0..200u64 {
            let by = if i % 2 == 0 { b } else { a };
            history.push(Operation::new(
                LamportTimestamp::new(i + 2, by),
                e,
                OpKind::update("value", FieldValue::Int(i as i64)),
                vec![insert.op_id],
            ));
        }

        let mut r = replica(3);
        let mut events = r.events();
        let now = Instant::now();
        for op in history {
            r.apply_remote_at(op, now);
        }

        loop {
            match events.try_recv() {
                Ok(SyncEvent::ConflictDetected(c)) => panic!("unexpected conflict {c:?}"),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(err) => panic!("event stream: {err}"),
            }
        }
        assert_eq!(r.get(&e).unwrap().get("value"), Some(&FieldValue::Int(199)));
    }

    #[test]
    fn test_history_replay_reports_no_conflicts() {
        let mut a = replica(1);
        let mut b = replica(2);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        b.apply_remote(insert.clone());
        let ua = a.apply_local(OpKind::update("value", "12k"), insert.target).unwrap();
        let ub = b.apply_local(OpKind::update("value", "15k"), insert.target).unwrap();

        let mut joiner = replica(3);
        let mut events = joiner.events();
        let now = Instant::now();
        for op in [insert.clone(), ua, ub] {
            joiner.apply_history_at(op, now);
        }
        assert!(std::iter::from_fn(|| events.try_recv().ok())
            .all(|e| !matches!(e, SyncEvent::ConflictDetected(_))));
        assert_eq!(text(&joiner, insert.target, "value").as_deref(), Some("15k"));
    }

    #[test]
    fn test_local_edits_record_observed_state() {
        let mut a = replica(1);
        let insert = a.insert([("value", FieldValue::text("10k"))]).unwrap();
        assert_eq!(insert.observed, None);
        let update = a.apply_local(OpKind::update("value", "12k"), insert.target).unwrap();
        assert_eq!(update.observed, Some(insert.timestamp));
        let delete = a.apply_local(OpKind::Delete, insert.target).unwrap();
        assert_eq!(delete.observed, Some(update.timestamp));
    }

    #[test]
    fn test_snapshot_does_not_grow_with_history() {
        let mut a = replica(1);
        let insert = a.insert([("value", FieldValue::Int(0))]).unwrap();
        let small = a.snapshot();
        for i in 1..500 {
            a.apply_local(OpKind::update("value", FieldValue::Int(i)), insert.target).unwrap();
        }
        let large = a.snapshot();
        assert_eq!(large.elements.len(), small.elements.len());

        // A joiner still treats the Insert as seen.
        let mut joiner = replica(2);
        joiner.merge(&large);
        assert!(joiner.has_seen(&insert.op_id));
        assert_eq!(joiner.apply_remote(insert), ApplyResult::Duplicate);
    }
}
