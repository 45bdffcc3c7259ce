//! Configuration keys the core consumes.
//!
//! A plain `Clone + Debug` struct with `chrono::Duration` fields and a
//! `Default` providing the documented defaults, optionally overridden from
//! the environment.

use chrono::Duration;

/// Tunables consumed by the worker / kill-watchdog machinery.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Duration before the kill watchdog forcibly errors a stuck flow.
    pub stuck_flows_timeout: Duration,
    /// Delay before re-notifying a request that could not yet be processed.
    pub notification_retry_interval: Duration,
    /// Number of notification-queue shards (for horizontal fan-out).
    pub queue_shards: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stuck_flows_timeout: Duration::hours(1),
            notification_retry_interval: Duration::seconds(30),
            queue_shards: 1,
        }
    }
}

impl WorkerConfig {
    /// Reads overrides from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("GRR_STUCK_FLOWS_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<i64>() {
                cfg.stuck_flows_timeout = Duration::seconds(secs);
            }
        }
        if let Ok(v) = std::env::var("GRR_NOTIFICATION_RETRY_INTERVAL_SECS") {
            if let Ok(secs) = v.parse::<i64>() {
                cfg.notification_retry_interval = Duration::seconds(secs);
            }
        }
        if let Ok(v) = std::env::var("GRR_QUEUE_SHARDS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.queue_shards = n;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.stuck_flows_timeout, Duration::hours(1));
        assert_eq!(cfg.notification_retry_interval, Duration::seconds(30));
        assert_eq!(cfg.queue_shards, 1);
    }
}
