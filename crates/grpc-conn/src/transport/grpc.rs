//! tonic-backed transport.
//!
//! tonic's `Channel` does not expose connectivity state, so
//! [`GrpcConnection`] derives it: `Ready` once connected, `TransientFailure`
//! after an RPC fails at the transport level, `Ready` again after the next
//! successful RPC, and `Shutdown` (sticky) once closed.
//!
//! `Channel` is cheap to clone; callers take a fresh [`RpcChannel`] per
//! client via [`GrpcConnection::channel`]. Closing marks the connection as
//! shut down; the socket is released when the last channel clone drops.

use super::interceptor::{RpcMetricsLayer, RpcMetricsService};
use super::{Connection, ConnectivityState, Dialer};
use crate::errors::DialError;
use crate::options::{DialOptions, TransportSecurity};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tower::Layer;
use tracing::{debug, warn};

/// Channel handed to tonic generated clients.
pub type RpcChannel = RpcMetricsService<Channel>;

/// Shared connectivity state of one dialed connection.
#[derive(Debug, Clone)]
pub(crate) struct StateTracker {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl StateTracker {
    pub(crate) fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn get(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub(crate) fn mark_ready(&self) {
        self.transition(ConnectivityState::Ready);
    }

    pub(crate) fn mark_transient_failure(&self) {
        self.transition(ConnectivityState::TransientFailure);
    }

    pub(crate) fn shutdown(&self) {
        self.transition(ConnectivityState::Shutdown);
    }

    /// Shutdown is terminal; no-op transitions do not wake waiters.
    fn transition(&self, next: ConnectivityState) {
        self.tx.send_if_modified(|current| {
            if *current == ConnectivityState::Shutdown || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    pub(crate) async fn wait_for_change(
        &self,
        cancel: &CancellationToken,
        last: ConnectivityState,
    ) -> bool {
        if last == ConnectivityState::Shutdown {
            return false;
        }

        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() != last {
                return true;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// A connected tonic channel plus its derived connectivity state.
#[derive(Debug)]
pub struct GrpcConnection {
    channel: RpcChannel,
    state: StateTracker,
}

impl GrpcConnection {
    /// Wrap an already-built channel. The connection starts `Ready`.
    #[must_use]
    pub fn from_channel(channel: Channel, instrumented: bool) -> Self {
        let state = StateTracker::new(ConnectivityState::Ready);
        let channel = RpcMetricsLayer::new(instrumented)
            .with_state(state.clone())
            .layer(channel);
        Self { channel, state }
    }

    /// A channel for building tonic clients.
    #[must_use]
    pub fn channel(&self) -> RpcChannel {
        self.channel.clone()
    }
}

#[async_trait::async_trait]
impl Connection for GrpcConnection {
    fn state(&self) -> ConnectivityState {
        self.state.get()
    }

    async fn wait_for_state_change(
        &self,
        cancel: &CancellationToken,
        last: ConnectivityState,
    ) -> bool {
        self.state.wait_for_change(cancel, last).await
    }

    fn close(&self) {
        self.state.shutdown();
    }
}

/// Dials with `tonic::transport::Endpoint::connect`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcDialer;

#[async_trait::async_trait]
impl Dialer for GrpcDialer {
    type Conn = GrpcConnection;

    async fn dial(&self, address: &str, options: &DialOptions) -> Result<GrpcConnection, DialError> {
        let endpoint = build_endpoint(address, options)?;

        let channel = endpoint.connect().await.map_err(|e| {
            warn!(
                target: "grpc_conn.transport",
                error = %e,
                address = %address,
                "Failed to connect"
            );
            DialError::Transport(e.to_string())
        })?;

        debug!(target: "grpc_conn.transport", address = %address, "Channel connected");
        Ok(GrpcConnection::from_channel(channel, options.instrumented))
    }
}

/// Build a tonic endpoint for `address`.
///
/// Bare `host:port` addresses get the scheme implied by the transport
/// security (`https` for TLS, `http` otherwise).
///
/// # Errors
///
/// Returns `DialError::InvalidEndpoint` for unparseable addresses or user
/// agents and `DialError::Tls` if the TLS configuration is rejected.
pub fn build_endpoint(address: &str, options: &DialOptions) -> Result<Endpoint, DialError> {
    let uri = if address.contains("://") {
        address.to_string()
    } else {
        format!("{}://{address}", options.security.scheme())
    };

    let mut endpoint =
        Endpoint::from_shared(uri).map_err(|e| DialError::InvalidEndpoint(e.to_string()))?;

    if let TransportSecurity::Tls(tls) = &options.security {
        ensure_crypto_provider();
        endpoint = endpoint
            .tls_config(tls.clone())
            .map_err(|e| DialError::Tls(e.to_string()))?;
    }
    if let Some(timeout) = options.rpc_timeout {
        endpoint = endpoint.timeout(timeout);
    }
    endpoint = endpoint.tcp_keepalive(options.tcp_keepalive);
    if let Some(user_agent) = &options.user_agent {
        endpoint = endpoint
            .user_agent(user_agent.clone())
            .map_err(|e| DialError::InvalidEndpoint(e.to_string()))?;
    }

    Ok(endpoint)
}

/// Install rustls' ring provider unless the process already chose one.
///
/// rustls panics on first use when no process-level provider is set and
/// the enabled features do not imply a single one.
fn ensure_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        // Err only if another thread installed a provider first
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
}
