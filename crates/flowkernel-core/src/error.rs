//! Error kinds for the scheduler / queue manager layer.
//!
//! Mirrors the propagation rule from the design: [`GrrError::MoreData`] is a
//! pagination signal the caller is expected to retry locally (flush, then
//! re-drive the scan); every other variant is fatal to the operation that
//! raised it.

use thiserror::Error;

/// Errors surfaced by the `Store` trait, the scheduler and the queue manager.
#[derive(Debug, Error)]
pub enum GrrError {
    /// A state name was not defined on the flow implementation.
    #[error("flow has no state method named '{0}'")]
    MissingState(String),

    /// A CPU or network budget was exhausted.
    #[error("resource limit exceeded: {0}")]
    LimitExceeded(String),

    /// A payload did not match the schema the caller expected.
    #[error("malformed message: {0}")]
    BadMessage(String),

    /// The Store layer denied the operation outright.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A scan hit a page boundary; the caller must flush and re-drive.
    #[error("more data available, re-drive after flushing")]
    MoreData,

    /// Any other Store failure; retryable via notification re-queue.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Catch-all for the injected Store collaborator's own driver errors.
    #[error("store driver error: {0}")]
    Store(String),
}

impl GrrError {
    /// True for errors the caller may retry without surfacing to the user.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GrrError::MoreData | GrrError::TransientStore(_))
    }
}

pub type Result<T> = std::result::Result<T, GrrError>;
