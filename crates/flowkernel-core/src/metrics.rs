//! Process-local counters surfaced alongside the scheduler and runner.
//! Kept as plain atomics rather than wired into a metrics-export crate:
//! nothing downstream needs more than process-lifetime counters yet, so
//! this stays at the same ambient level as the rest of the runtime.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters a worker process accumulates over its lifetime.
#[derive(Default)]
pub struct Metrics {
    /// Responses observed with a request id lower than the request id
    /// already processed (`grr_response_out_of_order`-equivalent).
    pub response_out_of_order: AtomicU64,
    /// Times a request was retransmitted to a client because its lease
    /// expired before a response arrived.
    pub request_retransmission_count: AtomicU64,
    /// Flows that transitioned to the `Error` state.
    pub flow_errors: AtomicU64,
    /// Flows that transitioned to the `Terminated` state.
    pub flow_completed_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_out_of_order(&self) {
        self.response_out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmission(&self) {
        self.request_retransmission_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_error(&self) {
        self.flow_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_completed(&self) {
        self.flow_completed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            response_out_of_order: self.response_out_of_order.load(Ordering::Relaxed),
            request_retransmission_count: self.request_retransmission_count.load(Ordering::Relaxed),
            flow_errors: self.flow_errors.load(Ordering::Relaxed),
            flow_completed_count: self.flow_completed_count.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time, non-atomic copy of [`Metrics`] for logging or tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub response_out_of_order: u64,
    pub request_retransmission_count: u64,
    pub flow_errors: u64,
    pub flow_completed_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = Metrics::new();
        metrics.record_out_of_order();
        metrics.record_out_of_order();
        metrics.record_flow_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.response_out_of_order, 2);
        assert_eq!(snap.flow_errors, 1);
        assert_eq!(snap.request_retransmission_count, 0);
    }
}
