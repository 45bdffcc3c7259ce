//! Flow runner: per-flow state machine, request/response correlation,
//! resource metering and the `ProcessCompletedRequests` drive loop.
//!
//! Built directly on `flowkernel_core`'s scheduler and queue manager; this
//! crate adds the notion of a flow as a named, dynamically-dispatched set
//! of state methods (`flow`), the runner those methods call back into
//! (`runner`), the loop that drains completed requests into them
//! (`process`), and CPU/network budget tracking (`resources`).

pub mod error;
pub mod flow;
pub mod process;
pub mod resources;
pub mod runner;

pub use error::{GrrError, Result};
pub use flow::FlowDefinition;
pub use process::process_completed_requests;
pub use runner::FlowRunner;
