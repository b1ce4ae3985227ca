//! Error types for iocore
//!
//! Exhaustion is never an error on the request path: requests that cannot be
//! satisfied are queued and signaled later. The variants here cover the cases
//! that do reach a caller.

use thiserror::Error;

/// Common result type for iocore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for iocore
#[derive(Debug, Error)]
pub enum Error {
    // Resource errors
    /// For callers that wrap a non-queueing path such as
    /// `BackpressurePool::try_allocate` and want an error instead of `None`.
    /// The pools and semaphores themselves queue rather than return it.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("request canceled")]
    Canceled,

    #[error("invalid waiter: {0}")]
    InvalidWaiter(String),

    #[error("cpu {cpu} out of range: {partitions} partitions")]
    InvalidCpu { cpu: usize, partitions: usize },

    #[error("cpu group {group} out of range: {groups} groups")]
    InvalidGroup { group: usize, groups: usize },

    // Dispatcher errors
    #[error("dispatcher is shut down")]
    ShutDown,

    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid waiter error
    pub fn invalid_waiter(msg: impl Into<String>) -> Self {
        Self::InvalidWaiter(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the condition clears on its own once resources come back
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }

    /// Check if this error means the caller withdrew the request
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// A request that was refused before it was queued.
///
/// The waiter is handed back so ownership returns to the requester exactly
/// once, even on the rejection path.
#[derive(Debug)]
pub struct RequestError<W> {
    waiter: W,
    error: Error,
}

impl<W> RequestError<W> {
    pub const fn new(waiter: W, error: Error) -> Self {
        Self { waiter, error }
    }

    /// The reason the request was refused
    pub const fn error(&self) -> &Error {
        &self.error
    }

    /// Take the waiter back
    pub fn into_inner(self) -> W {
        self.waiter
    }

    /// Split into the waiter and the error
    pub fn into_parts(self) -> (W, Error) {
        (self.waiter, self.error)
    }
}

impl<W> std::fmt::Display for RequestError<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request rejected: {}", self.error)
    }
}

impl<W: std::fmt::Debug> std::error::Error for RequestError<W> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_transient() {
        assert!(Error::ResourceExhausted("buffers".into()).is_transient());
        assert!(!Error::Canceled.is_transient());
        assert!(!Error::ShutDown.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidCpu {
            cpu: 9,
            partitions: 4,
        };
        assert_eq!(err.to_string(), "cpu 9 out of range: 4 partitions");
        assert!(Error::Canceled.is_canceled());
    }

    #[test]
    fn test_request_error_returns_waiter() {
        let rejected = RequestError::new(42u32, Error::invalid_waiter("zero"));
        assert_eq!(rejected.error().to_string(), "invalid waiter: zero");
        assert_eq!(rejected.to_string(), "request rejected: invalid waiter: zero");
        let (waiter, err) = rejected.into_parts();
        assert_eq!(waiter, 42);
        assert!(matches!(err, Error::InvalidWaiter(_)));
    }
}
