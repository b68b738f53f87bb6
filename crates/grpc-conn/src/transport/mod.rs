//! Transport seam.
//!
//! The supervisor is generic over a [`Dialer`] so the reconnect loop can be
//! driven by tonic in production and by scripted mocks in tests.

pub mod grpc;
pub mod interceptor;

use crate::errors::DialError;
use crate::options::DialOptions;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Transport-level connectivity state.
///
/// Numeric values match the gRPC connectivity enumeration and are exported
/// as the `grpc_connection_state` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// Not connected and not trying.
    Idle = 0,
    /// Establishing a connection.
    Connecting = 1,
    /// Connected and able to carry RPCs.
    Ready = 2,
    /// Connection failed; the transport may recover.
    TransientFailure = 3,
    /// Closed for good. Terminal.
    Shutdown = 4,
}

impl ConnectivityState {
    /// Gauge value for this state.
    #[must_use]
    pub fn as_gauge(self) -> f64 {
        f64::from(self as u8)
    }

    /// Label-friendly name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient_failure",
            ConnectivityState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dialed connection handle.
///
/// Shared read-only by every caller that acquired it. Only the supervisor
/// calls [`Connection::close`].
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Current connectivity state.
    fn state(&self) -> ConnectivityState;

    /// Wait until the state differs from `last`.
    ///
    /// Returns `true` when a transition was observed, `false` when `cancel`
    /// fired or `last` is [`ConnectivityState::Shutdown`] (no further
    /// transitions are possible).
    async fn wait_for_state_change(
        &self,
        cancel: &CancellationToken,
        last: ConnectivityState,
    ) -> bool;

    /// Close the connection. Idempotent; the state becomes `Shutdown`.
    fn close(&self);
}

/// Establishes connections to an address.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connection type produced by this dialer.
    type Conn: Connection;

    /// Dial `address` once. Retrying is the caller's job.
    async fn dial(&self, address: &str, options: &DialOptions) -> Result<Self::Conn, DialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_values_match_grpc_enumeration() {
        assert!((ConnectivityState::Idle.as_gauge() - 0.0).abs() < f64::EPSILON);
        assert!((ConnectivityState::Connecting.as_gauge() - 1.0).abs() < f64::EPSILON);
        assert!((ConnectivityState::Ready.as_gauge() - 2.0).abs() < f64::EPSILON);
        assert!((ConnectivityState::TransientFailure.as_gauge() - 3.0).abs() < f64::EPSILON);
        assert!((ConnectivityState::Shutdown.as_gauge() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectivityState::TransientFailure.to_string(), "transient_failure");
        assert_eq!(ConnectivityState::Ready.to_string(), "ready");
    }
}
