//! Task identity and payload.
//!
//! A task id packs a truncated creation timestamp into the high 32 bits and
//! a random nonzero value into the low 32 bits, so that ids sort
//! chronologically without a separate index and collisions across workers
//! scheduling at the same millisecond remain vanishingly unlikely.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::identity::QueueName;

/// Scheduling priority. Higher values are serviced first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Default retransmit budget: a task is leased and allowed to expire this
/// many times before the scheduler gives up on it.
pub const DEFAULT_TTL: u32 = 5;

/// A unit of work sitting in a queue, awaiting a worker to lease it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub queue: QueueName,
    pub id: u64,
    pub priority: Priority,
    pub payload: Vec<u8>,
    /// Remaining retransmit budget. Decremented each time a lease expires
    /// without the task being deleted; the task is dropped once it hits 0.
    pub ttl: u32,
    /// Number of times this task has been (re-)leased. Incremented only on
    /// re-lease, never on the first lease.
    pub transmission_count: u32,
    /// Millisecond timestamp the task becomes eligible for leasing, or
    /// `None` if eligible immediately.
    pub eta: Option<i64>,
    /// Millisecond timestamp the current lease expires, or `None` if
    /// unleased.
    pub lease_expiry: Option<i64>,
}

impl Task {
    /// Builds a fresh task id: `(now_millis truncated to 32 bits) << 32 | nonzero random 32 bits`.
    pub fn new_id(now_millis: i64) -> u64 {
        let time_high = (now_millis as u64) & 0xFFFF_FFFF;
        let mut rng = rand::thread_rng();
        let mut low = rng.next_u32();
        if low == 0 {
            low = 1;
        }
        (time_high << 32) | (low as u64)
    }

    pub fn new(queue: QueueName, priority: Priority, payload: Vec<u8>, now_millis: i64) -> Self {
        Self {
            queue,
            id: Task::new_id(now_millis),
            priority,
            payload,
            ttl: DEFAULT_TTL,
            transmission_count: 0,
            eta: None,
            lease_expiry: None,
        }
    }

    pub fn with_eta(mut self, eta_millis: i64) -> Self {
        self.eta = Some(eta_millis);
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn is_leased(&self, now_millis: i64) -> bool {
        self.lease_expiry.map(|exp| exp > now_millis).unwrap_or(false)
    }

    pub fn is_eligible(&self, now_millis: i64) -> bool {
        !self.is_leased(now_millis) && self.eta.map(|eta| eta <= now_millis).unwrap_or(true)
    }

    /// The column name this task is stored under in the `Store`: a
    /// zero-padded hex id so lexicographic ordering equals numeric ordering.
    pub fn column_name(&self) -> String {
        format!("task:{:016x}", self.id)
    }
}
