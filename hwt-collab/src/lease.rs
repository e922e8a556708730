//! Advisory per-element leases, enforced by the relay only.
//!
//! A lease is a time-boxed soft mutex for restructuring edits. It is not
//! part of the CRDT state: replicas still accept every operation, and a
//! lost race is reported to the caller as `LeaseContention`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::clock::SiteId;
use crate::element::ElementId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    Granted { expires_in: Duration },
    Denied { holder: SiteId },
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    holder: SiteId,
    expires_at: Instant,
}

pub struct LeaseTable {
    duration: Duration,
    leases: HashMap<ElementId, Lease>,
}

impl LeaseTable {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            leases: HashMap::new(),
        }
    }

    /// Grant, renew, or deny. Expired leases are taken over.
    pub fn acquire(&mut self, element: ElementId, site: SiteId, now: Instant) -> LeaseDecision {
        match self.leases.get(&element) {
            Some(lease) if lease.holder != site && lease.expires_at > now => {
                LeaseDecision::Denied { holder: lease.holder }
            }
            _ => {
                self.leases.insert(
                    element,
                    Lease {
                        holder: site,
                        expires_at: now + self.duration,
                    },
                );
                LeaseDecision::Granted {
                    expires_in: self.duration,
                }
            }
        }
    }

    /// Release a lease held by `site`. Releasing someone else's lease is a no-op.
    pub fn release(&mut self, element: &ElementId, site: SiteId) -> bool {
        match self.leases.get(element) {
            Some(lease) if lease.holder == site => {
                self.leases.remove(element);
                true
            }
            _ => false,
        }
    }

    /// Drop every lease held by a departing site.
    pub fn release_all(&mut self, site: SiteId) -> Vec<ElementId> {
        let mut released: Vec<ElementId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.holder == site)
            .map(|(e, _)| *e)
            .collect();
        released.sort();
        for element in &released {
            self.leases.remove(element);
        }
        released
    }

    /// Remove leases past their deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<(ElementId, SiteId)> {
        let mut expired = Vec::new();
        self.leases.retain(|element, lease| {
            let live = lease.expires_at > now;
            if !live {
                expired.push((*element, lease.holder));
            }
            live
        });
        expired
    }

    pub fn holder(&self, element: &ElementId, now: Instant) -> Option<SiteId> {
        self.leases
            .get(element)
            .filter(|l| l.expires_at > now)
            .map(|l| l.holder)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
