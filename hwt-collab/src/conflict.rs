//! Conflict surfacing.
//!
//! Last-writer-wins already decides every outcome deterministically. This
//! module only *classifies* some collisions as worth showing to a user:
//!
//! - two edits of one element from different sites inside a short window,
//! - a position written close to another site's freshly written position,
//! - a Delete meeting a reference that still points at the deleted element.
//!
//! The detector reads replica state but never writes it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::clock::{LamportTimestamp, SiteId};
use crate::config::EngineConfig;
use crate::element::{Element, ElementId, FieldName, FieldValue};
use crate::operation::{had_seen, OpId, OpKind, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Same element edited from two sites within the conflict window.
    ConcurrentEdit,
    /// Two sites placed elements on top of each other.
    SpatialProximity,
    /// A deleted element is still referenced by another site's edit.
    DanglingReference,
}

/// Observable conflict notification. Purely informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub element: ElementId,
    pub kind: ConflictKind,
    pub winning_op: OpId,
    pub losing_op: OpId,
}

/// Edits remembered per element for the concurrency check.
const RECENT_PER_ELEMENT: usize = 32;

#[derive(Debug, Clone)]
struct RecentEdit {
    op_id: OpId,
    site: SiteId,
    ts: LamportTimestamp,
    observed: Option<LamportTimestamp>,
    at: Instant,
}

impl RecentEdit {
    fn of(op: &Operation, at: Instant) -> Self {
        Self {
            op_id: op.op_id,
            site: op.site_id,
            ts: op.timestamp,
            observed: op.observed,
            at,
        }
    }

    /// Neither author had seen the other's write.
    fn concurrent_with(&self, other: &RecentEdit) -> bool {
        !had_seen(self.ts, self.observed, other.ts) && !had_seen(other.ts, other.observed, self.ts)
    }
}

#[derive(Debug, Clone)]
struct RecentPosition {
    edit: RecentEdit,
    x: f64,
    y: f64,
}

pub struct ConflictDetector {
    window: Duration,
    proximity_threshold: f64,
    position_fields: Vec<String>,
    recent: HashMap<ElementId, VecDeque<RecentEdit>>,
    positions: HashMap<ElementId, RecentPosition>,
    /// Last winning reference write per (element, field).
    ref_writers: HashMap<(ElementId, FieldName), RecentEdit>,
    /// Delete that tombstoned each element.
    deletions: HashMap<ElementId, RecentEdit>,
}

impl ConflictDetector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            window: config.conflict_window,
            proximity_threshold: config.proximity_threshold,
            position_fields: config.position_fields.clone(),
            recent: HashMap::new(),
            positions: HashMap::new(),
            ref_writers: HashMap::new(),
            deletions: HashMap::new(),
        }
    }

    /// Classify an operation that has just been applied.
    pub fn observe(
        &mut self,
        op: &Operation,
        elements: &BTreeMap<ElementId, Element>,
        now: Instant,
    ) -> Vec<Conflict> {
        let edit = RecentEdit::of(op, now);
        let mut conflicts = Vec::new();

        self.check_concurrent(op, &edit, now, &mut conflicts);

        match &op.kind {
            OpKind::Insert { fields } => {
                for (field, value) in fields {
                    self.track_field(op, &edit, field, value, elements, now, &mut conflicts);
                }
            }
            OpKind::Update { field, value } => {
                if won_field(elements, op, field) {
                    self.track_field(op, &edit, field, value, elements, now, &mut conflicts);
                }
            }
            OpKind::Delete => {
                self.check_dangling_on_delete(op, &edit, elements, &mut conflicts);
                self.positions.remove(&op.target);
            }
        }

        conflicts
    }

    /// Note an operation replayed from history without classifying it.
    ///
    /// Only reference and deletion bookkeeping is kept, so a live edit
    /// arriving afterwards can still be checked against it.
    pub fn record(&mut self, op: &Operation, elements: &BTreeMap<ElementId, Element>, now: Instant) {
        let edit = RecentEdit::of(op, now);
        match &op.kind {
            OpKind::Insert { fields } => {
                for (field, value) in fields {
                    self.note_references(op.target, &edit, field, value);
                }
            }
            OpKind::Update { field, value } => {
                if won_field(elements, op, field) {
                    self.note_references(op.target, &edit, field, value);
                }
            }
            OpKind::Delete => {
                let won = elements
                    .get(&op.target)
                    .map_or(false, |e| e.tombstone_timestamp == Some(op.timestamp));
                if won {
                    self.deletions.insert(op.target, edit);
                }
                self.positions.remove(&op.target);
            }
        }
    }

    /// Drop bookkeeping older than the window.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.recent.retain(|_, edits| {
            edits.retain(|e| now.saturating_duration_since(e.at) <= window);
            !edits.is_empty()
        });
        self.positions
            .retain(|_, p| now.saturating_duration_since(p.edit.at) <= window);
    }

    fn check_concurrent(
        &mut self,
        op: &Operation,
        edit: &RecentEdit,
        now: Instant,
        out: &mut Vec<Conflict>,
    ) {
        let window = self.window;
        let edits = self.recent.entry(op.target).or_default();
        edits.retain(|e| now.saturating_duration_since(e.at) <= window);

        for prior in edits
            .iter()
            .filter(|e| e.site != edit.site && e.concurrent_with(edit))
        {
            out.push(ranked(op.target, ConflictKind::ConcurrentEdit, prior, edit));
        }
        edits.push_back(edit.clone());
        while edits.len() > RECENT_PER_ELEMENT {
            edits.pop_front();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn track_field(
        &mut self,
        op: &Operation,
        edit: &RecentEdit,
        field: &str,
        value: &FieldValue,
        elements: &BTreeMap<ElementId, Element>,
        now: Instant,
        out: &mut Vec<Conflict>,
    ) {
        if let (true, Some((x, y))) = (self.is_position_field(field), value.as_point()) {
            self.check_proximity(op.target, edit, x, y, now, out);
            self.positions.insert(
                op.target,
                RecentPosition {
                    edit: edit.clone(),
                    x,
                    y,
                },
            );
        }

        for referenced in value.referenced_ids() {
            let deleted = elements.get(&referenced).map_or(false, |e| e.tombstoned);
            if let (true, Some(deletion)) = (deleted, self.deletions.get(&referenced)) {
                if deletion.site != edit.site {
                    out.push(Conflict {
                        element: referenced,
                        kind: ConflictKind::DanglingReference,
                        winning_op: deletion.op_id,
                        losing_op: edit.op_id,
                    });
                }
            }
        }
        self.note_references(op.target, edit, field, value);
    }

    fn note_references(&mut self, target: ElementId, edit: &RecentEdit, field: &str, value: &FieldValue) {
        let key = (target, field.to_string());
        if value.referenced_ids().is_empty() {
            self.ref_writers.remove(&key);
        } else {
            self.ref_writers.insert(key, edit.clone());
        }
    }

    fn check_proximity(
        &self,
        target: ElementId,
        edit: &RecentEdit,
        x: f64,
        y: f64,
        now: Instant,
        out: &mut Vec<Conflict>,
    ) {
        for (other, pos) in &self.positions {
            if *other == target || pos.edit.site == edit.site {
                continue;
            }
            if now.saturating_duration_since(pos.edit.at) > self.window {
                continue;
            }
            let distance = ((pos.x - x).powi(2) + (pos.y - y).powi(2)).sqrt();
            if distance < self.proximity_threshold {
                out.push(ranked(target, ConflictKind::SpatialProximity, &pos.edit, edit));
            }
        }
    }

    fn check_dangling_on_delete(
        &mut self,
        op: &Operation,
        edit: &RecentEdit,
        elements: &BTreeMap<ElementId, Element>,
        out: &mut Vec<Conflict>,
    ) {
        let Some(deleted) = elements.get(&op.target) else {
            return;
        };
        if deleted.tombstone_timestamp != Some(op.timestamp) {
            // An older delete lost to a newer one; that one was already classified.
            return;
        }
        self.deletions.insert(op.target, edit.clone());

        for element in elements.values().filter(|e| !e.tombstoned) {
            for (field, value) in &element.fields {
                if !value.references(&op.target) {
                    continue;
                }
                if let Some(writer) = self.ref_writers.get(&(element.id, field.clone())) {
                    if writer.site != edit.site {
                        out.push(Conflict {
                            element: op.target,
                            kind: ConflictKind::DanglingReference,
                            winning_op: edit.op_id,
                            losing_op: writer.op_id,
                        });
                    }
                }
            }
        }
    }

    fn is_position_field(&self, field: &str) -> bool {
        self.position_fields.iter().any(|f| f == field)
    }
}

fn won_field(elements: &BTreeMap<ElementId, Element>, op: &Operation, field: &str) -> bool {
    elements
        .get(&op.target)
        .and_then(|e| e.field_timestamps.get(field))
        .map_or(false, |ts| *ts == op.timestamp)
}

/// Order a pair by timestamp: the later write wins.
fn ranked(element: ElementId, kind: ConflictKind, a: &RecentEdit, b: &RecentEdit) -> Conflict {
    let (winner, loser) = if a.ts > b.ts { (a, b) } else { (b, a) };
    Conflict {
        element,
        kind,
        winning_op: winner.op_id,
        losing_op: loser.op_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OpKind;

    fn site(n: u128) -> SiteId {
        SiteId::from_u128(n)
    }

    fn op(counter: u64, s: u128, target: ElementId, kind: OpKind) -> Operation {
        Operation::new(LamportTimestamp::new(counter, site(s)), target, kind, Vec::new())
    }

    fn state(ops: &[&Operation]) -> BTreeMap<ElementId, Element> {
        let mut elements = BTreeMap::new();
        for op in ops {
            match &op.kind {
                OpKind::Insert { fields } => {
                    elements.entry(op.target).or_insert_with(|| {
                        Element::inserted(op.target, fields.clone(), op.timestamp, op.op_id)
                    });
                }
                OpKind::Update { field, value } => {
                    if let Some(e) = elements.get_mut(&op.target) {
                        e.write_field(field, value.clone(), op.timestamp);
                    }
                }
                OpKind::Delete => {
                    if let Some(e) = elements.get_mut(&op.target) {
                        e.write_tombstone(true, op.timestamp);
                    }
                }
            }
        }
        elements
    }

    #[test]
    fn test_concurrent_edit_within_window() {
        let mut detector = ConflictDetector::new(&EngineConfig::default());
        let e = ElementId::from_u128(1);
        let insert = op(1, 1, e, OpKind::insert([("value", FieldValue::text("10k"))]));
        let a = op(2, 1, e, OpKind::update("value", "12k"));
        let b = op(2, 2, e, OpKind::update("value", "15k"));
        let now = Instant::now();

        let elements = state(&[&insert, &a]);
        detector.observe(&insert, &elements, now);
        assert!(detector.observe(&a, &elements, now).is_empty());

        // b could have seen the insert (higher counter) but not a (same counter).
        let elements = state(&[&insert, &a, &b]);
        let conflicts = detector.observe(&b, &elements, now + Duration::from_millis(20));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].losing_op, a.op_id);
        assert_eq!(conflicts[0].winning_op, b.op_id);
        assert_eq!(conflicts[0].kind, ConflictKind::ConcurrentEdit);
    }

    #[test]
    fn test_observed_state_decides_concurrency() {
        let mut detector = ConflictDetector::new(&EngineConfig::default());
        let e = ElementId::from_u128(1);
        let insert = op(1, 1, e, OpKind::insert([("value", FieldValue::text("10k"))]));
        let a = op(2, 1, e, OpKind::update("value", "12k")).with_observed(Some(insert.timestamp));
        // Site 2 was busy elsewhere: higher counter, but it never saw `a`.
        let blind = op(9, 2, e, OpKind::update("value", "15k")).with_observed(Some(insert.timestamp));
        let informed = op(10, 2, e, OpKind::update("value", "18k")).with_observed(Some(a.timestamp));
        let now = Instant::now();

        let elements = state(&[&insert, &a, &blind, &informed]);
        detector.observe(&insert, &elements, now);
        detector.observe(&a, &elements, now);
        let conflicts = detector.observe(&blind, &elements, now);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].losing_op, a.op_id);
        assert!(detector.observe(&informed, &elements, now).is_empty());
    }

    #[test]
    fn test_recorded_history_is_not_classified() {
        let mut detector = ConflictDetector::new(&EngineConfig::default());
        let e = ElementId::from_u128(1);
        let insert = op(1, 1, e, OpKind::insert([("value", FieldValue::text("10k"))]));
        let a = op(2, 1, e, OpKind::update("value", "12k"));
        let b = op(2, 2, e, OpKind::update("value", "15k"));
        let now = Instant::now();

        let elements = state(&[&insert, &a, &b]);
        for op in [&insert, &a] {
            detector.record(op, &elements, now);
        }
        // Replayed edits are not candidates for a live conflict either.
        assert!(detector.observe(&b, &elements, now).is_empty());
    }

    #[test]
    fn test_recent_edits_are_capped() {
        let mut detector = ConflictDetector::new(&EngineConfig::default());
        let e = ElementId::from_u128(1);
        let now = Instant::now();
        let insert = op(1, 1, e, OpKind::insert([("value", FieldValue::text("0"))]));
        detector.observe(&insert, &state(&[&insert]), now);
        for i in 0..100u64 {
            let edit = op(2, 1, e, OpKind::update("value", FieldValue::Int(i as i64)));
            detector.observe(&edit, &BTreeMap::new(), now);
        }
        assert_eq!(detector.recent.get(&e).map(|edits| edits.len()), Some(RECENT_PER_ELEMENT));

        let rival = op(2, 2, e, OpKind::update("value", "x"));
        assert_eq!(detector.observe(&rival, &BTreeMap::new(), now).len(), RECENT_PER_ELEMENT);
    }

    #[test]
    fn test_edits_outside_window_are_not_conflicts() {
        let mut detector = ConflictDetector::new(&EngineConfig::default());
        let e = ElementId::from_u128(1);
        let insert = op(1, 1, e, OpKind::insert([("value", FieldValue::text("10k"))]));
        let b = op(2, 2, e, OpKind::update("value", "15k"));
        let now = Instant::now();

        let elements = state(&[&insert, &b]);
        detector.observe(&insert, &elements, now);
        let conflicts = detector.observe(&b, &elements, now + Duration::from_millis(500));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_spatial_proximity() {
        let mut detector = ConflictDetector::new(&EngineConfig::default());
        let r1 = ElementId::from_u128(1);
        let r2 = ElementId::from_u128(2);
        let a = op(1, 1, r1, OpKind::insert([("position", FieldValue::point(10.0, 10.0))]));
        let b = op(1, 2, r2, OpKind::insert([("position", FieldValue::point(10.3, 10.2))]));
        let now = Instant::now();

        let elements = state(&[&a, &b]);
        assert!(detector.observe(&a, &elements, now).is_empty());
        let conflicts = detector.observe(&b, &elements, now);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::SpatialProximity);
        assert_eq!(conflicts[0].winning_op, b.op_id);
    }

    #[test]
    fn test_far_positions_do_not_conflict() {
        let mut detector = ConflictDetector::new(&EngineConfig::default());
        let a = op(1, 1, ElementId::from_u128(1), OpKind::insert([("position", FieldValue::point(0.0, 0.0))]));
        let b = op(1, 2, ElementId::from_u128(2), OpKind::insert([("position", FieldValue::point(50.0, 0.0))]));
        let now = Instant::now();
        let elements = state(&[&a, &b]);
        detector.observe(&a, &elements, now);
        assert!(detector.observe(&b, &elements, now).is_empty());
    }

    #[test]
    fn test_delete_against_reference() {
        let mut detector = ConflictDetector::new(&EngineConfig::default());
        let net = ElementId::from_u128(1);
        let pin = ElementId::from_u128(2);
        let now = Instant::now();

        let net_insert = op(1, 1, net, OpKind::insert([("name", FieldValue::text("GND"))]));
        let pin_insert = op(2, 1, pin, OpKind::insert([("name", FieldValue::text("P1"))]));
        let link = op(3, 2, pin, OpKind::update("net", FieldValue::Ref(net)));
        let delete = op(4, 1, net, OpKind::Delete);

        let elements = state(&[&net_insert, &pin_insert, &link]);
        detector.observe(&net_insert, &elements, now);
        detector.observe(&pin_insert, &elements, now);
        detector.observe(&link, &elements, now);

        let elements = state(&[&net_insert, &pin_insert, &link, &delete]);
        let conflicts = detector.observe(&delete, &elements, now + Duration::from_secs(5));
        let dangling: Vec<_> = conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::DanglingReference)
            .collect();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].element, net);
        assert_eq!(dangling[0].winning_op, delete.op_id);
        assert_eq!(dangling[0].losing_op, link.op_id);
    }

    #[test]
    fn test_reference_to_already_deleted_element() {
        let mut detector = ConflictDetector::new(&EngineConfig::default());
        let net = ElementId::from_u128(1);
        let pin = ElementId::from_u128(2);
        let now = Instant::now();

        let net_insert = op(1, 1, net, OpKind::insert([("name", FieldValue::text("GND"))]));
        let pin_insert = op(1, 2, pin, OpKind::insert([("name", FieldValue::text("P1"))]));
        let delete = op(2, 1, net, OpKind::Delete);
        let link = op(3, 2, pin, OpKind::update("net", FieldValue::Ref(net)));

        let elements = state(&[&net_insert, &pin_insert, &delete]);
        detector.observe(&net_insert, &elements, now);
        detector.observe(&pin_insert, &elements, now);
        detector.observe(&delete, &elements, now);

        let elements = state(&[&net_insert, &pin_insert, &delete, &link]);
        let conflicts = detector.observe(&link, &elements, now + Duration::from_secs(5));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::DanglingReference);
        assert_eq!(conflicts[0].winning_op, delete.op_id);
    }
}
