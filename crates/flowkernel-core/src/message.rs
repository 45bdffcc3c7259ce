//! Wire message and request-bookkeeping types.
//!
//! `GrrMessage` is the envelope exchanged between a flow and a client (or
//! between a parent and child flow); `RequestState` is the durable record a
//! `FlowRunner` keeps per outstanding request so it can match up the
//! responses that eventually come back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{QueueName, SessionId};

/// The kind of payload a `GrrMessage` carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// A normal data-bearing response.
    Message,
    /// Terminal marker for one request: carries resource usage and the
    /// outcome (success or error) of processing it.
    Status,
    /// A partial result in a paginated response stream; more are expected.
    Iterator,
}

/// Outcome recorded on a `Status` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusOutcome {
    Ok,
    Error { message: String, backtrace: Option<String> },
}

/// One message flowing through a session's request/response queues.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GrrMessage {
    pub session_id: SessionId,
    pub request_id: u64,
    pub response_id: u64,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub outcome: Option<StatusOutcome>,
    /// CPU-seconds consumed producing this message, reported on `Status`.
    pub cpu_used: f64,
    /// Network bytes consumed producing this message, reported on `Status`.
    pub network_bytes_used: u64,
    pub created_at: DateTime<Utc>,
}

impl GrrMessage {
    pub fn is_status(&self) -> bool {
        matches!(self.message_type, MessageType::Status)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Some(StatusOutcome::Error { .. }))
    }
}

/// Durable record of one outbound request a flow is waiting on.
///
/// Lives in the queue manager's request queue until either a matching
/// `Status` response arrives or the flow is torn down.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestState {
    pub session_id: SessionId,
    pub request_id: u64,
    /// The state method to resume once this request completes.
    pub next_state: String,
    /// CPU-seconds budget remaining at the time this request was issued.
    pub cpu_limit: f64,
    /// Network byte budget remaining at the time this request was issued.
    pub network_bytes_limit: u64,
    /// Number of times this request has been retransmitted to the client.
    pub transmission_count: u32,
    /// The client queue this request's outbound `CallClient` task was
    /// scheduled on, so it can be purged once the request completes. `None`
    /// for requests that never went out to a client (e.g. `CallState`).
    pub client_queue: Option<QueueName>,
    /// The id of the outbound task on `client_queue`, paired with it above.
    pub client_task_id: Option<u64>,
    /// `CallState` scheduled for a future time: the request is not treated
    /// as completed before this timestamp even if a response already
    /// arrived. A `CallState` scheduled in the past still fires no earlier
    /// than `start_time`.
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_message_reports_error_outcome() {
        let msg = GrrMessage {
            session_id: SessionId::from("aff4:/CA/flows/x"),
            request_id: 1,
            response_id: 1,
            message_type: MessageType::Status,
            payload: vec![],
            outcome: Some(StatusOutcome::Error {
                message: "boom".into(),
                backtrace: None,
            }),
            cpu_used: 0.0,
            network_bytes_used: 0,
            created_at: Utc::now(),
        };
        assert!(msg.is_status());
        assert!(msg.is_error());
    }
}
