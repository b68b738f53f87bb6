//! Metric definitions.
//!
//! All metrics follow Prometheus naming conventions. Connection metrics are
//! labelled by `service` (the supervisor name) and `address`; cardinality
//! is bounded by the number of configured supervisors.

use crate::transport::ConnectivityState;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Label values shared by every connection metric of one supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Supervisor name.
    pub service: String,
    /// Dialed address.
    pub address: String,
}

impl MetricLabels {
    /// Build labels for a supervisor.
    #[must_use]
    pub fn new(service: &str, address: &str) -> Self {
        Self {
            service: service.to_string(),
            address: address.to_string(),
        }
    }
}

/// Sink for connection lifecycle metrics.
///
/// Injected through [`crate::Options`]. Implementations must be cheap;
/// they are called from the reconnect loop and the state watcher.
pub trait ConnectionMetrics: Send + Sync {
    /// Called once when the reconnect loop starts so series exist at zero.
    fn register(&self, _labels: &MetricLabels) {}

    /// A dial attempt is about to start.
    fn record_attempt(&self, labels: &MetricLabels);

    /// A dial attempt failed.
    fn record_attempt_error(&self, labels: &MetricLabels);

    /// A dialed connection is held (`true`) or released (`false`).
    fn set_connected(&self, labels: &MetricLabels, connected: bool);

    /// Connectivity state observed by the watcher.
    fn set_state(&self, labels: &MetricLabels, state: ConnectivityState);
}

/// Writes connection metrics to the `metrics` facade.
///
/// Records nothing until a recorder is installed (see
/// [`init_metrics_recorder`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl ConnectionMetrics for PrometheusMetrics {
    fn register(&self, labels: &MetricLabels) {
        counter!(
            "grpc_connection_attempts_total",
            "service" => labels.service.clone(),
            "address" => labels.address.clone()
        )
        .absolute(0);
        counter!(
            "grpc_connection_attempts_error",
            "service" => labels.service.clone(),
            "address" => labels.address.clone()
        )
        .absolute(0);
        self.set_connected(labels, false);
    }

    fn record_attempt(&self, labels: &MetricLabels) {
        counter!(
            "grpc_connection_attempts_total",
            "service" => labels.service.clone(),
            "address" => labels.address.clone()
        )
        .increment(1);
    }

    fn record_attempt_error(&self, labels: &MetricLabels) {
        counter!(
            "grpc_connection_attempts_error",
            "service" => labels.service.clone(),
            "address" => labels.address.clone()
        )
        .increment(1);
    }

    fn set_connected(&self, labels: &MetricLabels, connected: bool) {
        gauge!(
            "grpc_is_connected",
            "service" => labels.service.clone(),
            "address" => labels.address.clone()
        )
        .set(if connected { 1.0 } else { 0.0 });
    }

    fn set_state(&self, labels: &MetricLabels, state: ConnectivityState) {
        gauge!(
            "grpc_connection_state",
            "service" => labels.service.clone(),
            "address" => labels.address.clone()
        )
        .set(state.as_gauge());
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl ConnectionMetrics for NoopMetrics {
    fn record_attempt(&self, _labels: &MetricLabels) {}

    fn record_attempt_error(&self, _labels: &MetricLabels) {}

    fn set_connected(&self, _labels: &MetricLabels, _connected: bool) {}

    fn set_state(&self, _labels: &MetricLabels, _state: ConnectivityState) {}
}

/// Install the Prometheus recorder and return the handle for rendering
/// the scrape output.
///
/// Must be called before any metrics are recorded. Configures RPC latency
/// buckets for internal service calls.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("grpc_client_handling_seconds".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set RPC latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Record an RPC leaving the client.
///
/// Metric: `grpc_client_started_total`
/// Labels: `grpc_service`, `grpc_method`
pub fn record_rpc_started(service: &str, method: &str) {
    counter!(
        "grpc_client_started_total",
        "grpc_service" => service.to_string(),
        "grpc_method" => method.to_string()
    )
    .increment(1);
}

/// Record a completed RPC.
///
/// Metrics: `grpc_client_handled_total` (labels: `grpc_service`,
/// `grpc_method`, `grpc_code`) and `grpc_client_handling_seconds`
/// (labels: `grpc_service`, `grpc_method`).
pub fn record_rpc_handled(service: &str, method: &str, code: &str, duration: Duration) {
    counter!(
        "grpc_client_handled_total",
        "grpc_service" => service.to_string(),
        "grpc_method" => method.to_string(),
        "grpc_code" => code.to_string()
    )
    .increment(1);
    histogram!(
        "grpc_client_handling_seconds",
        "grpc_service" => service.to_string(),
        "grpc_method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}
