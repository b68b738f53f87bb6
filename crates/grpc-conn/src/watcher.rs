//! Connectivity state watcher.
//!
//! Mirrors a connection's transport-level state into the
//! `grpc_connection_state` gauge. It is a passive observer: nothing it sees
//! feeds back into the supervisor's redial decision.

use crate::observability::{ConnectionMetrics, MetricLabels};
use crate::transport::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Publish the current state, then every transition, until `cancel` fires
/// or the connection reports no further transitions.
///
/// The supervisor spawns one watcher per successful dial with a child of
/// its shutdown token; the token is cancelled when the connection is
/// superseded or the supervisor exits.
#[instrument(skip_all, fields(name = %labels.service, address = %labels.address))]
pub async fn watch_connection_state<C>(
    conn: &C,
    cancel: &CancellationToken,
    labels: &MetricLabels,
    metrics: &dyn ConnectionMetrics,
) where
    C: Connection + ?Sized,
{
    let mut state = conn.state();
    metrics.set_state(labels, state);
    debug!(target: "grpc_conn.watcher", state = %state, "Connection state");

    while conn.wait_for_state_change(cancel, state).await {
        state = conn.state();
        metrics.set_state(labels, state);
        debug!(target: "grpc_conn.watcher", state = %state, "Connection state changed");
    }

    debug!(target: "grpc_conn.watcher", state = %state, "Stopped watching connection state");
}
