use std::time::Duration;

/// Runtime-tunable knobs for one stage instance.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Broadcast buffer capacity for the peer channel and the value stream.
    pub bus_capacity: usize,
    /// How long `sync!` waits for a `:meta-pubed` ack before logging a
    /// warning and continuing to wait indefinitely.
    pub ack_timeout: Duration,
    /// Poll interval `subscribe_repos` uses while waiting for every
    /// subscribed key to appear in the stage.
    pub subscribe_poll_interval: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            ack_timeout: Duration::from_secs(10),
            subscribe_poll_interval: Duration::from_millis(100),
        }
    }
}
