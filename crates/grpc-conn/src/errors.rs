//! Error types for connection supervision.
//!
//! Dial failures never reach callers: the reconnect loop logs, counts and
//! retries them. Callers of [`crate::Supervisor::acquire`] only ever see
//! their own cancellation or the supervisor's permanent shutdown.

use std::time::Duration;
use thiserror::Error;

/// Construction-time validation errors. Not retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Supervisor name was empty.
    #[error("Connection name must not be empty")]
    EmptyName,

    /// Address is not a usable endpoint.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// More than one `Options` value was supplied.
    #[error("Expected at most one Options value, got {0}")]
    TooManyOptions(usize),

    /// Backoff parameters are out of range.
    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),
}

/// A single failed dial attempt.
///
/// Absorbed by the reconnect loop; exposed so custom [`crate::Dialer`]
/// implementations can report failures.
#[derive(Debug, Clone, Error)]
pub enum DialError {
    /// Dial did not complete within the configured connect timeout.
    #[error("Dial timed out after {0:?}")]
    Timeout(Duration),

    /// Endpoint could not be built from the address.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// TLS configuration was rejected by the transport.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Connection could not be established.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors returned by [`crate::Supervisor::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// The caller's cancellation token fired before a connection was served.
    #[error("Acquire cancelled by caller")]
    Cancelled,

    /// The caller's deadline elapsed before a connection was served.
    #[error("Acquire deadline exceeded")]
    DeadlineExceeded,

    /// The supervisor has shut down and will never serve again.
    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

impl AcquireError {
    /// Returns true if the supervisor is permanently gone.
    ///
    /// Callers use this to decide between retrying `acquire` and giving up
    /// (or recreating the supervisor).
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, AcquireError::ShutdownInProgress)
    }
}
