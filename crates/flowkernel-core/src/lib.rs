//! Durable task scheduler, queue manager and collection primitives over a
//! generic key/value [`store::Store`].
//!
//! This crate has no notion of a "flow" executing state methods — that
//! lives one layer up, in `flowkernel-runtime`. What lives here is the
//! substrate everything else is built on: task identity and leasing
//! (`task`, `scheduler`), durable request/response bookkeeping and the
//! notification queue (`queue_manager`), append-only result/log sequences
//! (`collections`), and the wire message shapes flows exchange with
//! clients (`message`).

pub mod collections;
pub mod config;
pub mod error;
pub mod flow_context;
pub mod identity;
pub mod message;
pub mod metrics;
pub mod queue_manager;
pub mod scheduler;
pub mod store;
#[cfg(feature = "sqlite-persistence")]
pub mod store_sqlite;
pub mod task;

pub use error::{GrrError, Result};
pub use identity::{ClientId, QueueName, SessionId};
