//! # grpc-conn Test Utilities
//!
//! In-memory stand-ins for the transport and the metrics sink, so
//! supervisor behavior can be tested without sockets or a global recorder.
//!
//! ## Modules
//!
//! - `mock_transport` - Scripted dialer and controllable connection
//! - `recording_metrics` - Metrics sink that records every call
//!
//! ## Usage
//!
//! ```rust,ignore
//! use grpc_conn::{Options, Supervisor};
//! use grpc_conn_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     // Fail twice, then connect
//!     let dialer = ScriptedDialer::failing_then_succeeding(2);
//!     let metrics = RecordingMetrics::new();
//!     let options = Options::insecure().with_metrics(metrics.sink());
//!
//!     let supervisor = Supervisor::with_dialer(dialer.clone(), "svc", "svc:1", [options]).unwrap();
//!     supervisor.start(CancellationToken::new());
//!
//!     let conn = supervisor.acquire_timeout(Duration::from_secs(30)).await.unwrap();
//!     assert_eq!(metrics.attempts(), 3);
//! }
//! ```

pub mod mock_transport;
pub mod recording_metrics;

pub use mock_transport::*;
pub use recording_metrics::*;
