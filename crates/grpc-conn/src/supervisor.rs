//! Connection supervisor.
//!
//! Owns one named, addressed connection: dials in the background, retries
//! with backoff, and serves the live connection to concurrent callers.
//!
//! # Hand-off
//!
//! There is no cached "current connection" field. Each
//! [`Supervisor::acquire`] sends a oneshot responder to the reconnect loop
//! and the loop answers it with whatever connection it is serving at that
//! moment. A caller can therefore never pick up a connection the loop has
//! already replaced or closed, and shutdown is observed by every waiter:
//! when the loop exits it closes the request channel and drops all queued
//! responders.
//!
//! # Reconnect loop
//!
//! ```text
//!            +-----------------------------+
//!            v                             |
//!   dial (connect_timeout) --err--> backoff(attempt++)
//!            |
//!            ok (attempt = 0, spawn watcher)
//!            v
//!   serve requests --connection shut down--> close, redial
//!            |
//!        shutdown token
//!            v
//!   close channel, release connection
//! ```

use crate::errors::{AcquireError, DialError, ValidationError};
use crate::observability::{ConnectionMetrics, MetricLabels};
use crate::options::Options;
use crate::transport::grpc::GrpcDialer;
use crate::transport::{Connection, ConnectivityState, Dialer};
use crate::watcher::watch_connection_state;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::codegen::http::uri::{Authority, Uri};
use tracing::{debug, info, instrument, warn};

/// Queued acquire requests. Callers beyond this wait to enqueue, which
/// keeps the hand-off close to a rendezvous.
const REQUEST_BUFFER: usize = 1;

type Responder<C> = oneshot::Sender<Arc<C>>;

/// Supervises one connection. Cheap to clone; clones share the loop.
pub struct Supervisor<D: Dialer = GrpcDialer> {
    shared: Arc<Shared<D>>,
}

struct Shared<D: Dialer> {
    name: String,
    address: String,
    options: Options,
    dialer: D,
    started: AtomicBool,
    requests: mpsc::Sender<Responder<D::Conn>>,
    /// Receiving end, moved into the loop by the first `start`.
    pending: Mutex<Option<mpsc::Receiver<Responder<D::Conn>>>>,
}

impl<D: Dialer> Clone for Supervisor<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Dialer> fmt::Debug for Supervisor<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.shared.name)
            .field("address", &self.shared.address)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl Supervisor<GrpcDialer> {
    /// Create a supervisor that dials with tonic.
    ///
    /// Accepts zero or one `Options` (e.g. `[]`, `None`, `Some(opts)`,
    /// `[opts]`). Defaults to [`Options::default`], the TLS preset.
    /// Remember to call [`Supervisor::start`].
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if the name is empty, the address is not
    /// an endpoint, or more than one `Options` is supplied.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        options: impl IntoIterator<Item = Options>,
    ) -> Result<Self, ValidationError> {
        Self::with_dialer(GrpcDialer, name, address, options)
    }
}

impl<D: Dialer> Supervisor<D> {
    /// Create a supervisor with a custom transport.
    ///
    /// # Errors
    ///
    /// Same as [`Supervisor::new`].
    pub fn with_dialer(
        dialer: D,
        name: impl Into<String>,
        address: impl Into<String>,
        options: impl IntoIterator<Item = Options>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        let address = address.into();

        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        validate_address(&address)?;

        let mut options: Vec<Options> = options.into_iter().collect();
        if options.len() > 1 {
            return Err(ValidationError::TooManyOptions(options.len()));
        }
        let options = options.pop().unwrap_or_default();

        let (requests, pending) = mpsc::channel(REQUEST_BUFFER);

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                address,
                options,
                dialer,
                started: AtomicBool::new(false),
                requests,
                pending: Mutex::new(Some(pending)),
            }),
        })
    }

    /// Supervisor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Dialed address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Options fixed at construction.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Whether the reconnect loop has been launched.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Launch the reconnect loop. Only the first call on any clone does
    /// anything; it returns the loop's handle. Later calls return `None`.
    ///
    /// Returns immediately, without waiting for the first dial. Cancelling
    /// `shutdown` stops the loop for good.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                target: "grpc_conn.supervisor",
                name = %self.shared.name,
                "Supervisor already started"
            );
            return None;
        }

        let requests = match self.shared.pending.lock() {
            Ok(mut pending) => pending.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }?;

        Some(tokio::spawn(Arc::clone(&self.shared).run(requests, shutdown)))
    }

    /// Wait for the live connection.
    ///
    /// Returns when the loop serves a connection, `cancel` fires
    /// (`AcquireError::Cancelled`), or the supervisor has shut down
    /// (`AcquireError::ShutdownInProgress`). Cancelling `cancel` only
    /// aborts this call.
    ///
    /// # Errors
    ///
    /// See above. Dial failures are never returned; the call keeps waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Arc<D::Conn>, AcquireError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AcquireError::Cancelled),
            result = self.request() => result,
        }
    }

    /// [`Supervisor::acquire`] bounded by a deadline.
    ///
    /// # Errors
    ///
    /// `AcquireError::DeadlineExceeded` if `timeout` elapses first,
    /// `AcquireError::ShutdownInProgress` after shutdown.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Arc<D::Conn>, AcquireError> {
        tokio::time::timeout(timeout, self.request())
            .await
            .map_err(|_| AcquireError::DeadlineExceeded)?
    }

    async fn request(&self) -> Result<Arc<D::Conn>, AcquireError> {
        let (responder, response) = oneshot::channel();
        self.shared
            .requests
            .send(responder)
            .await
            .map_err(|_| AcquireError::ShutdownInProgress)?;
        response.await.map_err(|_| AcquireError::ShutdownInProgress)
    }
}

impl<D: Dialer> Shared<D> {
    #[instrument(skip_all, fields(name = %self.name, address = %self.address))]
    async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<Responder<D::Conn>>,
        shutdown: CancellationToken,
    ) {
        let labels = MetricLabels::new(&self.name, &self.address);
        let metrics = Arc::clone(&self.options.metrics);
        metrics.register(&labels);

        info!(target: "grpc_conn.supervisor", "Connection supervisor started");

        let mut attempt: u32 = 0;
        let mut live: Option<LiveConnection<D::Conn>> = None;

        loop {
            metrics.record_attempt(&labels);
            debug!(target: "grpc_conn.supervisor", attempt = attempt, "Dialing");

            let dialed = tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.dial() => result,
            };

            let conn = match dialed {
                Ok(conn) => Arc::new(conn),
                Err(e) => {
                    metrics.record_attempt_error(&labels);
                    let delay = self.options.retry.next(attempt);
                    warn!(
                        target: "grpc_conn.supervisor",
                        error = %e,
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        "Failed to dial, will retry"
                    );

                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            info!(target: "grpc_conn.supervisor", attempts = attempt.saturating_add(1), "Connected");
            attempt = 0;

            let watcher = shutdown.child_token();
            tokio::spawn({
                let conn = Arc::clone(&conn);
                let watcher = watcher.clone();
                let labels = labels.clone();
                let metrics = Arc::clone(&metrics);
                async move {
                    watch_connection_state(conn.as_ref(), &watcher, &labels, metrics.as_ref())
                        .await;
                }
            });

            metrics.set_connected(&labels, true);
            live = Some(LiveConnection {
                conn: Arc::clone(&conn),
                watcher,
                labels: labels.clone(),
                metrics: Arc::clone(&metrics),
            });

            match serve(&mut requests, &conn, &shutdown).await {
                ServeOutcome::Shutdown => break,
                ServeOutcome::Invalidated => {
                    warn!(
                        target: "grpc_conn.supervisor",
                        "Connection shut down by transport, redialing"
                    );
                    // Old connection is closed before the next one serves
                    live = None;
                }
            }
        }

        requests.close();
        while requests.try_recv().is_ok() {}
        drop(live);

        info!(target: "grpc_conn.supervisor", "Connection supervisor shut down");
    }

    async fn dial(&self) -> Result<D::Conn, DialError> {
        let dial = self.dialer.dial(&self.address, &self.options.dial);
        match self.options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| DialError::Timeout(limit))?,
            None => dial.await,
        }
    }
}

/// The connection currently owned by the loop.
///
/// Dropping it stops the watcher, closes the connection and clears the
/// connected gauge, whether the connection was superseded or the loop
/// exited.
struct LiveConnection<C: Connection> {
    conn: Arc<C>,
    watcher: CancellationToken,
    labels: MetricLabels,
    metrics: Arc<dyn ConnectionMetrics>,
}

impl<C: Connection> Drop for LiveConnection<C> {
    fn drop(&mut self) {
        self.conn.close();
        self.watcher.cancel();
        self.metrics.set_connected(&self.labels, false);
    }
}

enum ServeOutcome {
    /// Shutdown token fired.
    Shutdown,
    /// The connection reached `Shutdown` on its own.
    Invalidated,
}

async fn serve<C: Connection>(
    requests: &mut mpsc::Receiver<Responder<C>>,
    conn: &Arc<C>,
    shutdown: &CancellationToken,
) -> ServeOutcome {
    let invalidated = wait_until_closed(conn.as_ref(), shutdown);
    tokio::pin!(invalidated);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return ServeOutcome::Shutdown,
            () = &mut invalidated => return ServeOutcome::Invalidated,
            request = requests.recv() => match request {
                // Err means the caller stopped waiting
                Some(responder) => {
                    let _ = responder.send(Arc::clone(conn));
                }
                None => return ServeOutcome::Shutdown,
            },
        }
    }
}

/// Resolves once the connection reports `Shutdown`. Never resolves if the
/// wait is cancelled.
async fn wait_until_closed<C: Connection>(conn: &C, shutdown: &CancellationToken) {
    let mut state = conn.state();
    while state != ConnectivityState::Shutdown {
        if !conn.wait_for_state_change(shutdown, state).await {
            std::future::pending::<()>().await;
        }
        state = conn.state();
    }
}

/// Accepts `http(s)://authority[/...]` URIs and bare `host:port`.
fn validate_address(address: &str) -> Result<(), ValidationError> {
    if address.trim().is_empty() {
        return Err(ValidationError::InvalidAddress(
            "address is empty".to_string(),
        ));
    }
    if address.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidAddress(format!(
            "{address:?} contains whitespace"
        )));
    }

    if let Some((scheme, _)) = address.split_once("://") {
        if !matches!(scheme, "http" | "https") {
            return Err(ValidationError::InvalidAddress(format!(
                "unsupported scheme {scheme:?}"
            )));
        }
        let uri: Uri = address
            .parse()
            .map_err(|e| ValidationError::InvalidAddress(format!("{address:?}: {e}")))?;
        let Some(authority) = uri.authority().filter(|a| !a.host().is_empty()) else {
            return Err(ValidationError::InvalidAddress(format!(
                "{address:?} has no host"
            )));
        };
        // The port is optional here, but must be valid when written
        if port_text(authority).is_some() && authority.port_u16().is_none() {
            return Err(ValidationError::InvalidAddress(format!(
                "{address:?} has an invalid port"
            )));
        }
        return Ok(());
    }

    let authority: Authority = address
        .parse()
        .map_err(|e| ValidationError::InvalidAddress(format!("{address:?}: {e}")))?;
    if authority.host().is_empty() {
        return Err(ValidationError::InvalidAddress(format!(
            "{address:?} has no host"
        )));
    }
    if authority.port_u16().is_none() {
        return Err(ValidationError::InvalidAddress(format!(
            "{address:?} has no port"
        )));
    }

    Ok(())
}

/// Text after the port separator, if the authority has one. Skips
/// userinfo and bracketed IPv6 hosts.
fn port_text(authority: &Authority) -> Option<&str> {
    let host_port = authority
        .as_str()
        .rsplit_once('@')
        .map_or(authority.as_str(), |(_, rest)| rest);
    let after_host = host_port
        .rfind(']')
        .map_or(Some(host_port), |end| host_port.get(end + 1..))?;
    after_host.rsplit_once(':').map(|(_, port)| port)
}
