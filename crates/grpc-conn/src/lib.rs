//! Supervised gRPC client connections.
//!
//! A [`Supervisor`] owns one named, addressed connection. It dials in the
//! background, retries with exponential backoff, and hands the live
//! connection to any number of concurrent [`Supervisor::acquire`] callers.
//! A [`Pool`] groups supervisors by name.
//!
//! # Lifecycle
//!
//! 1. [`Supervisor::new`] validates name and address (nothing is dialed)
//! 2. [`Supervisor::start`] launches the reconnect loop exactly once
//! 3. [`Supervisor::acquire`] blocks until a connection is served, the
//!    caller's token is cancelled, or the supervisor has shut down
//! 4. Cancelling the token passed to `start` shuts the supervisor down;
//!    every later `acquire` returns [`AcquireError::ShutdownInProgress`]
//!
//! # Example
//!
//! ```rust,ignore
//! use grpc_conn::{Options, Supervisor};
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! let shutdown = CancellationToken::new();
//! let inventory = Supervisor::new("inventory", "inventory.internal:50051", [Options::insecure()])?;
//! inventory.start(shutdown.clone());
//!
//! let conn = inventory.acquire_timeout(Duration::from_secs(5)).await?;
//! let mut client = InventoryClient::new(conn.channel());
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod config;
pub mod errors;
pub mod observability;
pub mod options;
pub mod pool;
pub mod supervisor;
pub mod transport;
pub mod watcher;

pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use config::{ConfigError, PoolConfig};
pub use errors::{AcquireError, DialError, ValidationError};
pub use observability::{ConnectionMetrics, MetricLabels, NoopMetrics, PrometheusMetrics};
pub use options::{DialOptions, Options, TransportSecurity};
pub use pool::Pool;
pub use supervisor::Supervisor;
pub use transport::grpc::{GrpcConnection, GrpcDialer, RpcChannel};
pub use transport::{Connection, ConnectivityState, Dialer};
pub use watcher::watch_connection_state;
