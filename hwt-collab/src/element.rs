//! Document elements and their per-field last-writer-wins state.
//!
//! Elements live in an id-keyed arena inside the replica. Graph edges
//! (a component referencing a net that references it back) are stored as
//! [`FieldValue::Ref`] / [`FieldValue::RefList`] ids, never as owned links.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::clock::LamportTimestamp;
use crate::operation::OpId;

/// Client-generated element identifier (random 128-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId(Uuid);

impl ElementId {
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

impl Default for ElementId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ElementId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Field names are free-form; the engine gives meaning only to the
/// configured position fields (see `EngineConfig::position_fields`).
pub type FieldName = String;

/// Typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
    /// 2D position in document coordinates.
    Point { x: f64, y: f64 },
    /// Reference to another element.
    Ref(ElementId),
    /// Ordered references (net members, selection groups).
    RefList(Vec<ElementId>),
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Text(s.into())
    }

    pub fn point(x: f64, y: f64) -> Self {
        FieldValue::Point { x, y }
    }

    pub fn as_point(&self) -> Option<(f64, f64)> {
        match self {
            FieldValue::Point { x, y } => Some((*x, *y)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value points at `id`.
    pub fn references(&self, id: &ElementId) -> bool {
        match self {
            FieldValue::Ref(r) => r == id,
            FieldValue::RefList(list) => list.contains(id),
            _ => false,
        }
    }

    /// Every element id this value points at.
    pub fn referenced_ids(&self) -> Vec<ElementId> {
        match self {
            FieldValue::Ref(r) => vec![*r],
            FieldValue::RefList(list) => list.clone(),
            _ => Vec::new(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// One element of the shared document.
///
/// Invariant: every key in `fields` has an entry in `field_timestamps`, and
/// the value is the one written by the operation carrying that timestamp.
/// Deletion is the pseudo-field `tombstoned`, merged by the same rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub fields: BTreeMap<FieldName, FieldValue>,
    pub field_timestamps: BTreeMap<FieldName, LamportTimestamp>,
    pub tombstoned: bool,
    pub tombstone_timestamp: Option<LamportTimestamp>,
    /// The Insert that created this element; later edits depend on it.
    pub inserted_by: OpId,
}

impl Element {
    /// Build an element from an Insert: every field stamped with `ts`.
    pub fn inserted(
        id: ElementId,
        fields: BTreeMap<FieldName, FieldValue>,
        ts: LamportTimestamp,
        inserted_by: OpId,
    ) -> Self {
        let field_timestamps = fields.keys().map(|k| (k.clone(), ts)).collect();
        Self {
            id,
            fields,
            field_timestamps,
            tombstoned: false,
            tombstone_timestamp: None,
            inserted_by,
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Last-writer-wins write of one field.
    ///
    /// Returns `true` if `ts` beat the recorded timestamp and the value was
    /// taken.
    pub fn write_field(&mut self, field: &str, value: FieldValue, ts: LamportTimestamp) -> bool {
        match self.field_timestamps.get(field) {
            Some(current) if *current >= ts => false,
            _ => {
                self.fields.insert(field.to_string(), value);
                self.field_timestamps.insert(field.to_string(), ts);
                true
            }
        }
    }

    /// Last-writer-wins write of the tombstone pseudo-field.
    pub fn write_tombstone(&mut self, tombstoned: bool, ts: LamportTimestamp) -> bool {
        match self.tombstone_timestamp {
            Some(current) if current >= ts => false,
            _ => {
                self.tombstoned = tombstoned;
                self.tombstone_timestamp = Some(ts);
                true
            }
        }
    }

    /// Merge another copy of the same element field by field.
    ///
    /// Returns the number of fields (tombstone included) that changed.
    pub fn merge_from(&mut self, other: &Element) -> usize {
        let mut changed = 0;
        for (field, ts) in &other.field_timestamps {
            if let Some(value) = other.fields.get(field) {
                if self.write_field(field, value.clone(), *ts) {
                    changed += 1;
                }
            }
        }
        if let Some(ts) = other.tombstone_timestamp {
            if self.write_tombstone(other.tombstoned, ts) {
                changed += 1;
            }
        }
        changed
    }

    /// Highest timestamp recorded anywhere on this element.
    pub fn max_timestamp(&self) -> Option<LamportTimestamp> {
        self.field_timestamps
            .values()
            .copied()
            .chain(self.tombstone_timestamp)
            .max()
    }
}
