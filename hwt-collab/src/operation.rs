//! Operations: the immutable unit of change exchanged between replicas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::clock::{LamportTimestamp, SiteId};
use crate::element::{ElementId, FieldName, FieldValue};

/// Globally unique operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(Uuid);

impl OpId {
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

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an operation does to its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Create the element with its initial fields.
    Insert { fields: BTreeMap<FieldName, FieldValue> },
    /// Set one field.
    Update { field: FieldName, value: FieldValue },
    /// Tombstone the element.
    Delete,
}

impl OpKind {
    pub fn insert<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<FieldName>,
    {
        OpKind::Insert {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn update(field: impl Into<FieldName>, value: impl Into<FieldValue>) -> Self {
        OpKind::Update {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Insert { .. } => "insert",
            OpKind::Update { .. } => "update",
            OpKind::Delete => "delete",
        }
    }

    /// Delete is the only structural kind.
    pub fn is_structural(&self) -> bool {
        matches!(self, OpKind::Delete)
    }
}

/// A stamped, immutable change to one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: OpId,
    pub site_id: SiteId,
    pub timestamp: LamportTimestamp,
    pub target: ElementId,
    pub kind: OpKind,
    /// Operations that must be applied before this one.
    pub causal_deps: Vec<OpId>,
    /// Newest write to the target the author had applied when making this
    /// edit. `None` for inserts and hand-built operations.
    pub observed: Option<LamportTimestamp>,
}

impl Operation {
    pub fn new(
        timestamp: LamportTimestamp,
        target: ElementId,
        kind: OpKind,
        causal_deps: Vec<OpId>,
    ) -> Self {
        Self {
            op_id: OpId::new(),
            site_id: timestamp.site_id,
            timestamp,
            target,
            kind,
            causal_deps,
            observed: None,
        }
    }

    /// Record the target state the author had seen.
    pub fn with_observed(mut self, observed: Option<LamportTimestamp>) -> Self {
        self.observed = observed;
        self
    }

    /// Whether the author had seen a write to the target stamped
    /// `earlier_ts` or newer. Falls back to Lamport order without a record.
    pub fn follows(&self, earlier_ts: LamportTimestamp) -> bool {
        had_seen(self.timestamp, self.observed, earlier_ts)
    }

    /// The field this operation writes, if any.
    pub fn field(&self) -> Option<&str> {
        match &self.kind {
            OpKind::Update { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Causal test shared by operations and the records kept about them.
pub(crate) fn had_seen(
    timestamp: LamportTimestamp,
    observed: Option<LamportTimestamp>,
    earlier_ts: LamportTimestamp,
) -> bool {
    match observed {
        Some(seen) => seen >= earlier_ts,
        None => timestamp.counter > earlier_ts.counter,
    }
}

/// Where an applied operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
}

/// Item of the replica's subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOp {
    pub op: Operation,
    pub origin: Origin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_operation_takes_site_from_timestamp() {
        let site = SiteId::from_u128(7);
        let op = Operation::new(
            LamportTimestamp::new(1, site),
            ElementId::from_u128(1),
            OpKind::Delete,
            Vec::new(),
        );
        assert_eq!(op.site_id, site);
        assert!(op.kind.is_structural());
        assert!(op.field().is_none());
    }

    #[test]
    fn test_kind_builders() {
        let kind = OpKind::insert([("value", FieldValue::text("10k"))]);
        match kind {
            OpKind::Insert { fields } => assert_eq!(fields.len(), 1),
            other => panic!("expected insert, got {other:?}"),
        }
        assert_eq!(OpKind::update("value", "12k").name(), "update");
    }

    #[test]
    fn test_follows_uses_observed_state() {
        let (a, b) = (SiteId::from_u128(1), SiteId::from_u128(2));
        let target = ElementId::from_u128(1);
        let earlier = LamportTimestamp::new(5, a);

        let blind = Operation::new(LamportTimestamp::new(9, b), target, OpKind::Delete, Vec::new())
            .with_observed(Some(LamportTimestamp::new(3, a)));
        assert!(!blind.follows(earlier));

        let informed = blind.clone().with_observed(Some(earlier));
        assert!(informed.follows(earlier));

        // Without a record, only a higher counter can follow.
        let bare = Operation::new(LamportTimestamp::new(5, b), target, OpKind::Delete, Vec::new());
        assert!(!bare.follows(earlier));
        assert!(bare.follows(LamportTimestamp::new(4, b)));
    }
}
