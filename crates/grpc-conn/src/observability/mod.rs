//! Observability for supervised connections.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `grpc_connection_attempts_total` | Counter | `service`, `address` | Dial attempts |
//! | `grpc_connection_attempts_error` | Counter | `service`, `address` | Failed dial attempts |
//! | `grpc_is_connected` | Gauge | `service`, `address` | 1 while a dialed connection is held |
//! | `grpc_connection_state` | Gauge | `service`, `address` | Connectivity state (idle=0 .. shutdown=4) |
//! | `grpc_client_started_total` | Counter | `grpc_service`, `grpc_method` | RPCs started |
//! | `grpc_client_handled_total` | Counter | `grpc_service`, `grpc_method`, `grpc_code` | RPCs completed |
//! | `grpc_client_handling_seconds` | Histogram | `grpc_service`, `grpc_method` | RPC latency |
//!
//! Connection metrics go through an injected [`ConnectionMetrics`] sink so
//! the supervisor can be tested without a recorder. RPC metrics are written
//! straight to the `metrics` facade by the interceptor.

pub mod metrics;

pub use metrics::{
    init_metrics_recorder, record_rpc_handled, record_rpc_started, ConnectionMetrics,
    MetricLabels, NoopMetrics, PrometheusMetrics,
};
