//! Identity newtypes for sessions, queues and tasks.
//!
//! Kept as thin `String` wrappers (rather than raw `String` everywhere) so
//! that a `SessionId` can never be passed where a `QueueName` is expected by
//! accident.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A flow instance identifier: `aff4:/<queue>/flows/<client_id?>/<nonce>`
/// in shape, opaque otherwise except that the queue name is recoverable.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(queue: &str, client_id: Option<&str>, nonce: &str) -> Self {
        let inner = match client_id {
            Some(c) => format!("aff4:/{queue}/flows/{c}/{nonce}"),
            None => format!("aff4:/{queue}/flows/{nonce}"),
        };
        SessionId(inner)
    }

    /// Recovers the queue name from the URN shape.
    pub fn queue(&self) -> &str {
        self.0
            .strip_prefix("aff4:/")
            .and_then(|rest| rest.split('/').next())
            .unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The name of a task queue (e.g. a client queue or a worker queue).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        QueueName(s.to_string())
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        QueueName(s)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client identifier (opaque outside the core).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The client's own task queue name.
    pub fn queue(&self) -> QueueName {
        QueueName(self.0.clone())
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_recovers_queue_name() {
        let sid = SessionId::new("CA", Some("C.1234"), "AAAAAAAA");
        assert_eq!(sid.queue(), "CA");
        assert_eq!(sid.as_str(), "aff4:/CA/flows/C.1234/AAAAAAAA");
    }

    #[test]
    fn session_id_without_client() {
        let sid = SessionId::new("W", None, "nonce");
        assert_eq!(sid.queue(), "W");
    }
}
