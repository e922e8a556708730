//! Lamport clock and site identity.
//!
//! Every replica owns one [`LamportClock`]. Local edits are stamped with
//! [`LamportClock::tick`]; every received timestamp is fed through
//! [`LamportClock::observe`] so that local time always moves past anything
//! the replica has seen.
//!
//! Timestamps are totally ordered: counter first, then site id as the
//! tie-break. Two different sites can never produce equal timestamps.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Identity of one connected editing session.
///
/// Assigned once per session and never reused. Ordered by the numeric
/// (big-endian) value of the underlying UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(Uuid);

impl SiteId {
    /// Fresh random site id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Site id with a fixed numeric value (tests, replays).
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// The nil site, used by the relay for messages it originates.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SiteId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell collaborators apart in logs.
        let s = self.0.to_string();
        f.write_str(&s[..8])
    }
}

/// A `(counter, site_id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LamportTimestamp {
    pub counter: u64,
    pub site_id: SiteId,
}

impl LamportTimestamp {
    pub fn new(counter: u64, site_id: SiteId) -> Self {
        Self { counter, site_id }
    }
}

impl Ord for LamportTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.site_id.cmp(&other.site_id))
    }
}

impl PartialOrd for LamportTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LamportTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.counter, self.site_id)
    }
}

/// Per-site monotonic logical clock.
#[derive(Debug, Clone)]
pub struct LamportClock {
    site_id: SiteId,
    counter: u64,
}

impl LamportClock {
    pub fn new(site_id: SiteId) -> Self {
        Self { site_id, counter: 0 }
    }

    /// Advance local time and return the new timestamp.
    pub fn tick(&mut self) -> LamportTimestamp {
        self.counter += 1;
        LamportTimestamp::new(self.counter, self.site_id)
    }

    /// Fold a remote timestamp into local time.
    ///
    /// Sets the counter to `max(local, remote) + 1`. Produces no operation.
    pub fn observe(&mut self, remote: LamportTimestamp) {
        self.counter = self.counter.max(remote.counter) + 1;
    }

    /// Current time without advancing it.
    pub fn current(&self) -> LamportTimestamp {
        LamportTimestamp::new(self.counter, self.site_id)
    }

    /// Resume from a persisted counter. Never moves the clock backwards.
    pub fn restore(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }
}
