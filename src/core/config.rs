//! Raft configuration parameters

use std::time::Duration;

/// Configuration for Raft timing and channel parameters.
///
/// The heartbeat interval must stay well below the minimum election
/// timeout, otherwise followers start elections against a live leader.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by the leader (default: 100ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms)
    pub election_timeout_max: Duration,
    /// How often the apply pump drains committed entries (default: 20ms)
    pub apply_interval: Duration,
    /// Capacity of the apply channel; a full channel blocks the pump
    /// (default: 64)
    pub apply_channel_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            apply_interval: Duration::from_millis(20),
            apply_channel_capacity: 64,
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Create a new config with custom apply pump cadence
    pub fn with_apply_interval(mut self, interval: Duration) -> Self {
        self.apply_interval = interval;
        self
    }

    /// Create a new config with custom apply channel capacity
    pub fn with_apply_channel_capacity(mut self, capacity: usize) -> Self {
        self.apply_channel_capacity = capacity;
        self
    }

    /// Generate a random election timeout within the configured range.
    /// Re-rolled for every wait so nodes do not stay in lockstep.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}
