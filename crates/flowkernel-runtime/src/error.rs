//! Re-exports the shared error type; the runner raises the same
//! [`GrrError`] variants the scheduler and queue manager do, so callers
//! only ever match on one enum regardless of which layer raised it.

pub use flowkernel_core::error::{GrrError, Result};
