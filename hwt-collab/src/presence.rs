//! Presence: ephemeral "who is looking at what" state.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! PresenceThrottle::offer()   (coalesced, 20 Hz)
//!       │
//!       ▼
//! SyncMessage::Presence  ──►  relay (forwarded, never stored)
//!                                  │
//!                                  ▼
//!                     remote PresenceTracker::update()
//!                                  │
//!                                  ▼
//!                     PresenceTracker::sweep()  ──► CollaboratorLeft
//! ```
//!
//! Presence is advisory and not part of the CRDT state: the last message
//! wins unconditionally and lost messages are never retried.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

use crate::clock::SiteId;
use crate::element::ElementId;
use crate::events::SyncEvent;

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

/// Cursor position in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

impl Cursor {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    Editing,
    #[default]
    Viewing,
    Idle,
}

/// Partial presence state sent by one site.
///
/// `None` fields leave the receiver's record untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub site_id: SiteId,
    pub cursor: Option<Cursor>,
    pub selection: Option<Vec<ElementId>>,
    pub activity: Activity,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub sent_at: u64,
}

impl PresenceMessage {
    pub fn new(site_id: SiteId, activity: Activity) -> Self {
        Self {
            site_id,
            cursor: None,
            selection: None,
            activity,
            sent_at: unix_millis(),
        }
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_selection(mut self, selection: Vec<ElementId>) -> Self {
        self.selection = Some(selection);
        self
    }

    /// The same state stamped with the current time, for keepalive resends.
    pub fn refreshed(&self) -> Self {
        Self {
            sent_at: unix_millis(),
            ..self.clone()
        }
    }

    /// Fold an older, unsent patch underneath this one.
    fn coalesce(mut self, older: PresenceMessage) -> Self {
        if self.cursor.is_none() {
            self.cursor = older.cursor;
        }
        if self.selection.is_none() {
            self.selection = older.selection;
        }
        self
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// What this replica currently believes about one collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub site_id: SiteId,
    pub cursor: Option<Cursor>,
    pub selection: Vec<ElementId>,
    pub activity: Activity,
    pub last_seen: Instant,
}

/// Remote collaborators of one document, evicted by periodic sweep.
pub struct PresenceTracker {
    local_site: SiteId,
    records: HashMap<SiteId, PresenceRecord>,
    events: Option<broadcast::Sender<SyncEvent>>,
}

impl PresenceTracker {
    pub fn new(local_site: SiteId) -> Self {
        Self {
            local_site,
            records: HashMap::new(),
            events: None,
        }
    }

    /// Emit join/leave notifications on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Merge a presence message and refresh `last_seen`.
    ///
    /// Returns `true` when the site was not known before.
    pub fn update(&mut self, msg: &PresenceMessage, now: Instant) -> bool {
        if msg.site_id == self.local_site {
            return false;
        }

        let mut joined = false;
        let record = self.records.entry(msg.site_id).or_insert_with(|| {
            joined = true;
            PresenceRecord {
                site_id: msg.site_id,
                cursor: None,
                selection: Vec::new(),
                activity: Activity::default(),
                last_seen: now,
            }
        });

        if let Some(cursor) = msg.cursor {
            record.cursor = Some(cursor);
        }
        if let Some(selection) = &msg.selection {
            record.selection = selection.clone();
        }
        record.activity = msg.activity;
        record.last_seen = now;

        if joined {
            log::debug!("Collaborator {} appeared", msg.site_id);
            self.emit(SyncEvent::CollaboratorJoined(msg.site_id));
        }
        joined
    }

    /// Remove a site that said goodbye explicitly.
    pub fn remove(&mut self, site_id: &SiteId) -> bool {
        let removed = self.records.remove(site_id).is_some();
        if removed {
            self.emit(SyncEvent::CollaboratorLeft(*site_id));
        }
        removed
    }

    /// Evict every record not refreshed within `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<SiteId> {
        let mut stale: Vec<SiteId> = self
            .records
            .values()
            .filter(|r| now.saturating_duration_since(r.last_seen) > timeout)
            .map(|r| r.site_id)
            .collect();
        stale.sort();

        for site in &stale {
            self.records.remove(site);
            log::debug!("Collaborator {site} timed out");
            self.emit(SyncEvent::CollaboratorLeft(*site));
        }
        stale
    }

    /// Current records, ordered by site.
    pub fn presence(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|r| r.site_id);
        records
    }

    pub fn get(&self, site_id: &SiteId) -> Option<&PresenceRecord> {
        self.records.get(site_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Source-side rate limiting
// ───────────────────────────────────────────────────────────────────

/// Coalesces outgoing presence to at most one message per interval.
///
/// The newest state wins; intermediate states are folded, not queued.
#[derive(Debug)]
pub struct PresenceThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    held: Option<PresenceMessage>,
}

impl PresenceThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            held: None,
        }
    }

    /// Offer a new local state. Returns the message to send now, if any.
    pub fn offer(&mut self, msg: PresenceMessage, now: Instant) -> Option<PresenceMessage> {
        let msg = match self.held.take() {
            Some(older) => msg.coalesce(older),
            None => msg,
        };
        if self.ready(now) {
            self.last_sent = Some(now);
            Some(msg)
        } else {
            self.held = Some(msg);
            None
        }
    }

    /// Release a held message once the interval has passed.
    pub fn flush(&mut self, now: Instant) -> Option<PresenceMessage> {
        if self.held.is_some() && self.ready(now) {
            self.last_sent = Some(now);
            self.held.take()
        } else {
            None
        }
    }

    pub fn has_held(&self) -> bool {
        self.held.is_some()
    }

    fn ready(&self, now: Instant) -> bool {
        self.last_sent
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }
}
