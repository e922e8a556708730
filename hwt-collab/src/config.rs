//! Engine and relay tuning knobs.

use std::time::Duration;

/// Per-replica engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a buffered remote operation waits for its dependency before
    /// an integrity gap is reported. Default: 30s.
    pub dependency_timeout: Duration,
    /// Two edits to one element from different sites closer than this are
    /// surfaced as a conflict. Default: 100ms.
    pub conflict_window: Duration,
    /// Distance under which concurrent position writes are flagged.
    pub proximity_threshold: f64,
    /// Fields holding `FieldValue::Point` positions.
    pub position_fields: Vec<String>,
    /// Offline queue bound. Default: 10,000 operations.
    pub offline_queue_capacity: usize,
    /// Presence records older than this are swept. Default: 30s.
    pub presence_timeout: Duration,
    /// Source-side presence rate limit. Default: 20 Hz.
    pub presence_rate_hz: u32,
    /// Largest operation gap replayed as a log tail; above this the replica
    /// asks for a snapshot instead. Default: 5,000.
    pub max_tail_replay: u64,
    /// Period of the actor's maintenance tick (sweeps, expiry). Default: 1s.
    pub maintenance_interval: Duration,
    /// Buffer size of the subscription and event broadcast channels.
    pub event_capacity: usize,
    /// How long [`EngineHandle::acquire_lease`](crate::engine::EngineHandle::acquire_lease)
    /// waits for the relay's answer. Default: 10s.
    pub lease_reply_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dependency_timeout: Duration::from_secs(30),
            conflict_window: Duration::from_millis(100),
            proximity_threshold: 1.0,
            position_fields: vec!["position".to_string()],
            offline_queue_capacity: 10_000,
            presence_timeout: Duration::from_secs(30),
            presence_rate_hz: 20,
            max_tail_replay: 5_000,
            maintenance_interval: Duration::from_secs(1),
            event_capacity: 1024,
            lease_reply_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Small bounds and short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            dependency_timeout: Duration::from_millis(200),
            offline_queue_capacity: 16,
            presence_timeout: Duration::from_millis(200),
            max_tail_replay: 64,
            maintenance_interval: Duration::from_millis(20),
            event_capacity: 256,
            lease_reply_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Minimum spacing between outgoing presence messages.
    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.presence_rate_hz.max(1)))
    }
}

/// Per-document relay session configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Operations kept in memory for tail catch-up. Default: 10,000.
    pub retention: usize,
    /// A checkpoint snapshot is taken every this many operations. Default: 1,000.
    pub checkpoint_interval: usize,
    /// Advisory lease duration. Default: 30s.
    pub lease_duration: Duration,
    /// Messages buffered per peer before it lags. Default: 256.
    pub broadcast_capacity: usize,
    /// Maximum participants per document. Default: 100.
    pub max_peers_per_session: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retention: 10_000,
            checkpoint_interval: 1_000,
            lease_duration: Duration::from_secs(30),
            broadcast_capacity: 256,
            max_peers_per_session: 100,
        }
    }
}

impl RelayConfig {
    pub fn for_testing() -> Self {
        Self {
            retention: 32,
            checkpoint_interval: 8,
            lease_duration: Duration::from_millis(300),
            broadcast_capacity: 64,
            max_peers_per_session: 10,
        }
    }
}
