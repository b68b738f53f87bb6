//! Supervisor options and the two presets.
//!
//! [`Options::default`] requires TLS; [`Options::insecure`] dials plaintext.
//! Both share the default backoff, RPC instrumentation and the Prometheus
//! metrics sink. Consumers may build a fully custom value with the
//! `with_*` methods.

use crate::backoff::{ExponentialBackoff, RetryPolicy};
use crate::observability::{ConnectionMetrics, PrometheusMetrics};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::ClientTlsConfig;

/// Transport credential policy.
#[derive(Debug, Clone)]
pub enum TransportSecurity {
    /// Dial `https://` with the given TLS configuration.
    Tls(ClientTlsConfig),
    /// Dial `http://` without transport encryption.
    Insecure,
}

impl TransportSecurity {
    /// TLS using the platform's native root certificates.
    #[must_use]
    pub fn native_tls() -> Self {
        TransportSecurity::Tls(ClientTlsConfig::new().with_native_roots())
    }

    /// URI scheme used when the address has none.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportSecurity::Tls(_) => "https",
            TransportSecurity::Insecure => "http",
        }
    }
}

/// Transport configuration passed to the [`crate::Dialer`].
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Credential policy.
    pub security: TransportSecurity,
    /// Per-RPC timeout applied by the channel.
    pub rpc_timeout: Option<Duration>,
    /// TCP keepalive interval.
    pub tcp_keepalive: Option<Duration>,
    /// `user-agent` header sent on every RPC.
    pub user_agent: Option<String>,
    /// Wrap the channel in the RPC metrics interceptor.
    pub instrumented: bool,
}

impl DialOptions {
    /// TLS, instrumented.
    #[must_use]
    pub fn secure() -> Self {
        Self {
            security: TransportSecurity::native_tls(),
            rpc_timeout: None,
            tcp_keepalive: None,
            user_agent: None,
            instrumented: true,
        }
    }

    /// Plaintext, instrumented.
    #[must_use]
    pub fn insecure() -> Self {
        Self {
            security: TransportSecurity::Insecure,
            ..Self::secure()
        }
    }
}

impl Default for DialOptions {
    fn default() -> Self {
        Self::secure()
    }
}

/// Options fixed at supervisor construction.
#[derive(Clone)]
pub struct Options {
    /// Bound on a single dial. `None` means only the shutdown token bounds it.
    pub connect_timeout: Option<Duration>,
    /// Delay between failed dials.
    pub retry: Arc<dyn RetryPolicy>,
    /// Transport configuration.
    pub dial: DialOptions,
    /// Where connection metrics are written.
    pub metrics: Arc<dyn ConnectionMetrics>,
}

impl Options {
    /// Secure preset (same as [`Options::default`]).
    #[must_use]
    pub fn secure() -> Self {
        Self::with_dial(DialOptions::secure())
    }

    /// Explicitly insecure preset.
    #[must_use]
    pub fn insecure() -> Self {
        Self::with_dial(DialOptions::insecure())
    }

    fn with_dial(dial: DialOptions) -> Self {
        Self {
            connect_timeout: None,
            retry: Arc::new(ExponentialBackoff::default()),
            dial,
            metrics: Arc::new(PrometheusMetrics),
        }
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(retry);
        self
    }

    /// Replace the dial options.
    #[must_use]
    pub fn with_dial_options(mut self, dial: DialOptions) -> Self {
        self.dial = dial;
        self
    }

    /// Set the per-RPC timeout.
    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.dial.rpc_timeout = Some(timeout);
        self
    }

    /// Inject a metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn ConnectionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::secure()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("connect_timeout", &self.connect_timeout)
            .field("retry", &"<policy>")
            .field("dial", &self.dial)
            .field("metrics", &"<sink>")
            .finish()
    }
}
