//! `FlowContext`: the durable state a `FlowRunner` mutates while a flow is
//! alive.
//!
//! `RUNNING -> TERMINATED` and `RUNNING -> ERROR` are the only legal
//! transitions; both terminal states are sticky. The three counters are
//! kept behind one lock because `CallClient`/`CallFlow` read-then-increment
//! `next_outbound_id` and that must stay consistent with
//! `outstanding_requests` even if two callers race.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    Running,
    Terminated,
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
struct Counters {
    next_outbound_id: u64,
    next_processed_request: u64,
    outstanding_requests: u64,
}

/// Durable per-flow bookkeeping. Not `Clone`: callers share one instance
/// behind a reference, the way a `FlowRunner` owns exactly one context.
#[derive(Debug)]
pub struct FlowContext {
    pub session_id: SessionId,
    pub creator: Option<SessionId>,
    pub started_at: DateTime<Utc>,
    pub kill_timestamp: Mutex<Option<DateTime<Utc>>>,
    state: Mutex<FlowState>,
    counters: Mutex<Counters>,
    error: Mutex<Option<String>>,
}

impl FlowContext {
    pub fn new(session_id: SessionId, creator: Option<SessionId>, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            creator,
            started_at,
            kill_timestamp: Mutex::new(None),
            state: Mutex::new(FlowState::Running),
            counters: Mutex::new(Counters {
                next_outbound_id: 1,
                next_processed_request: 1,
                outstanding_requests: 0,
            }),
            error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock().expect("flow context state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.state() == FlowState::Running
    }

    /// Allocates the next outbound request id and marks one more request
    /// outstanding, atomically.
    pub fn next_outbound_id(&self) -> u64 {
        let mut counters = self.counters.lock().expect("counters lock poisoned");
        let id = counters.next_outbound_id;
        counters.next_outbound_id += 1;
        counters.outstanding_requests += 1;
        id
    }

    pub fn next_processed_request(&self) -> u64 {
        self.counters.lock().expect("counters lock poisoned").next_processed_request
    }

    /// Advances the processed-request cursor and reduces the outstanding
    /// count. Returns the new outstanding count so callers can detect
    /// "all requests drained" without a second lock acquisition.
    pub fn advance_processed_request(&self) -> u64 {
        let mut counters = self.counters.lock().expect("counters lock poisoned");
        counters.next_processed_request += 1;
        counters.outstanding_requests = counters.outstanding_requests.saturating_sub(1);
        counters.outstanding_requests
    }

    pub fn outstanding_requests(&self) -> u64 {
        self.counters.lock().expect("counters lock poisoned").outstanding_requests
    }

    /// `RUNNING -> TERMINATED`. No-op if already terminal.
    pub fn terminate(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == FlowState::Running {
            *state = FlowState::Terminated;
        }
    }

    /// `RUNNING -> ERROR`, recording the message. No-op if already terminal:
    /// both terminal states are sticky.
    pub fn error(&self, message: String) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == FlowState::Running {
            *state = FlowState::Error;
            *self.error.lock().expect("error lock poisoned") = Some(message);
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.lock().expect("error lock poisoned").clone()
    }

    pub fn extend_kill_timestamp(&self, new_deadline: DateTime<Utc>) {
        *self.kill_timestamp.lock().expect("kill timestamp lock poisoned") = Some(new_deadline);
    }

    pub fn kill_timestamp(&self) -> Option<DateTime<Utc>> {
        *self.kill_timestamp.lock().expect("kill timestamp lock poisoned")
    }
}
