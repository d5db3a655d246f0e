//! Error taxonomy, matching spec.md §7's table of error kinds.

use thiserror::Error;

/// Errors raised by an [`crate::upstream::UpstreamClient`] implementation.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream connection error: {0}")]
    Connection(String),
    #[error("upstream returned malformed data: {0}")]
    Malformed(String),
    #[error("upstream reported {got} items for {expected} expected")]
    CountMismatch { expected: usize, got: usize },
    #[error("method not available")]
    MethodNotAvailable,
    #[error("not found: {0}")]
    NotFound(String),
}

impl UpstreamError {
    /// True for failures worth blindly retrying (network hiccups), as
    /// opposed to ones that indicate a structural mismatch.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Timeout | UpstreamError::Connection(_))
    }
}
