//! Mock transport for supervisor testing.
//!
//! [`ScriptedDialer`] replays a list of dial outcomes and hands out
//! [`MockConnection`]s whose connectivity state the test drives directly.
//! Both are cheap to clone; clones share state, so a test keeps one copy
//! for assertions and gives the other to the supervisor.

use async_trait::async_trait;
use grpc_conn::{Connection, ConnectivityState, DialError, DialOptions, Dialer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection whose state is set by the test.
#[derive(Debug, Clone)]
pub struct MockConnection {
    inner: Arc<MockConnectionInner>,
}

#[derive(Debug)]
struct MockConnectionInner {
    id: u64,
    state: watch::Sender<ConnectivityState>,
    script: Mutex<VecDeque<ConnectivityState>>,
    close_calls: AtomicUsize,
}

impl MockConnection {
    /// A connection in `Ready`.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self::with_state(id, ConnectivityState::Ready)
    }

    /// A connection starting in `state`.
    #[must_use]
    pub fn with_state(id: u64, state: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(state);
        Self {
            inner: Arc::new(MockConnectionInner {
                id,
                state: tx,
                script: Mutex::new(VecDeque::new()),
                close_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// A connection that walks through `states` in order.
    ///
    /// Starts in the first state. Each `wait_for_state_change` moves to
    /// the next one immediately; once the script is exhausted it waits for
    /// [`MockConnection::set_state`] like any other mock.
    #[must_use]
    pub fn scripted(id: u64, states: impl IntoIterator<Item = ConnectivityState>) -> Self {
        let mut states: VecDeque<ConnectivityState> = states.into_iter().collect();
        let initial = states.pop_front().unwrap_or(ConnectivityState::Idle);
        let conn = Self::with_state(id, initial);
        *lock(&conn.inner.script) = states;
        conn
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Move to `state`. `Shutdown` is terminal and cannot be left.
    pub fn set_state(&self, state: ConnectivityState) {
        self.inner.state.send_if_modified(|current| {
            if *current == ConnectivityState::Shutdown || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// The transport gave up on its own: state becomes `Shutdown` without
    /// `close` being called.
    pub fn simulate_transport_shutdown(&self) {
        self.set_state(ConnectivityState::Shutdown);
    }

    /// Number of `close` calls made by the owner.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    async fn wait_for_state_change(
        &self,
        cancel: &CancellationToken,
        last: ConnectivityState,
    ) -> bool {
        if cancel.is_cancelled() || last == ConnectivityState::Shutdown {
            return false;
        }

        let scripted = lock(&self.inner.script).pop_front();
        if let Some(next) = scripted {
            self.inner.state.send_replace(next);
            return true;
        }

        let mut rx = self.inner.state.subscribe();
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

    fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectivityState::Shutdown);
    }
}

/// What a single dial does.
#[derive(Debug, Clone)]
pub enum DialOutcome {
    /// Return `DialError::Transport` with this message.
    Fail(String),
    /// Return a fresh `Ready` connection.
    Succeed,
    /// Never complete.
    Hang,
}

/// Dialer that replays scripted outcomes.
#[derive(Debug, Clone)]
pub struct ScriptedDialer {
    inner: Arc<ScriptedDialerInner>,
}

#[derive(Debug)]
struct ScriptedDialerInner {
    outcomes: Mutex<VecDeque<DialOutcome>>,
    fallback: DialOutcome,
    dial_times: Mutex<Vec<Instant>>,
    addresses: Mutex<Vec<String>>,
    connections: Mutex<Vec<MockConnection>>,
    next_id: AtomicU64,
}

impl Default for ScriptedDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDialer {
    /// Every dial succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_outcomes([], DialOutcome::Succeed)
    }

    /// Replay `outcomes`, then repeat `fallback` forever.
    #[must_use]
    pub fn with_outcomes(
        outcomes: impl IntoIterator<Item = DialOutcome>,
        fallback: DialOutcome,
    ) -> Self {
        Self {
            inner: Arc::new(ScriptedDialerInner {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                fallback,
                dial_times: Mutex::new(Vec::new()),
                addresses: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Fail `failures` times, then succeed.
    #[must_use]
    pub fn failing_then_succeeding(failures: usize) -> Self {
        Self::with_outcomes(
            (0..failures).map(|i| DialOutcome::Fail(format!("connection refused ({i})"))),
            DialOutcome::Succeed,
        )
    }

    /// Every dial fails.
    #[must_use]
    pub fn always_failing() -> Self {
        Self::with_outcomes([], DialOutcome::Fail("connection refused".to_string()))
    }

    /// Every dial hangs.
    #[must_use]
    pub fn hanging() -> Self {
        Self::with_outcomes([], DialOutcome::Hang)
    }

    #[must_use]
    pub fn dial_count(&self) -> usize {
        lock(&self.inner.dial_times).len()
    }

    /// When each dial started (tokio clock).
    #[must_use]
    pub fn dial_times(&self) -> Vec<Instant> {
        lock(&self.inner.dial_times).clone()
    }

    #[must_use]
    pub fn dialed_addresses(&self) -> Vec<String> {
        lock(&self.inner.addresses).clone()
    }

    /// Connections handed out so far, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<MockConnection> {
        lock(&self.inner.connections).clone()
    }

    #[must_use]
    pub fn last_connection(&self) -> Option<MockConnection> {
        lock(&self.inner.connections).last().cloned()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    type Conn = MockConnection;

    async fn dial(&self, address: &str, _options: &DialOptions) -> Result<MockConnection, DialError> {
        lock(&self.inner.dial_times).push(Instant::now());
        lock(&self.inner.addresses).push(address.to_string());

        let outcome = lock(&self.inner.outcomes)
            .pop_front()
            .unwrap_or_else(|| self.inner.fallback.clone());

        match outcome {
            DialOutcome::Fail(message) => Err(DialError::Transport(message)),
            DialOutcome::Succeed => {
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                let conn = MockConnection::new(id);
                lock(&self.inner.connections).push(conn.clone());
                Ok(conn)
            }
            DialOutcome::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_dialer_replays_outcomes() {
        let dialer = ScriptedDialer::failing_then_succeeding(2);
        let options = DialOptions::insecure();

        assert!(dialer.dial("svc:1", &options).await.is_err());
        assert!(dialer.dial("svc:1", &options).await.is_err());
        let conn = dialer.dial("svc:1", &options).await.unwrap();

        assert_eq!(conn.id(), 1);
        assert_eq!(dialer.dial_count(), 3);
        assert_eq!(dialer.connections().len(), 1);
        assert_eq!(dialer.dialed_addresses(), vec!["svc:1"; 3]);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let conn = MockConnection::new(7);
        conn.close();
        conn.set_state(ConnectivityState::Ready);

        assert_eq!(conn.state(), ConnectivityState::Shutdown);
        assert_eq!(conn.close_calls(), 1);
        assert!(
            !conn
                .wait_for_state_change(&CancellationToken::new(), ConnectivityState::Shutdown)
                .await
        );
    }

    #[tokio::test]
    async fn test_transport_shutdown_does_not_count_as_close() {
        let conn = MockConnection::new(1);
        conn.simulate_transport_shutdown();
        assert_eq!(conn.state(), ConnectivityState::Shutdown);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_scripted_connection_walks_states() {
        let conn = MockConnection::scripted(
            1,
            [ConnectivityState::Idle, ConnectivityState::Connecting, ConnectivityState::Ready],
        );
        let cancel = CancellationToken::new();

        assert_eq!(conn.state(), ConnectivityState::Idle);
        assert!(conn.wait_for_state_change(&cancel, ConnectivityState::Idle).await);
        assert_eq!(conn.state(), ConnectivityState::Connecting);
        assert!(conn.wait_for_state_change(&cancel, ConnectivityState::Connecting).await);
        assert_eq!(conn.state(), ConnectivityState::Ready);

        cancel.cancel();
        assert!(!conn.wait_for_state_change(&cancel, ConnectivityState::Ready).await);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_set_state() {
        let conn = MockConnection::new(1);
        let cancel = CancellationToken::new();

        let waiter = {
            let conn = conn.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                conn.wait_for_state_change(&cancel, ConnectivityState::Ready)
                    .await
            })
        };

        tokio::task::yield_now().await;
        conn.set_state(ConnectivityState::TransientFailure);
        assert!(waiter.await.unwrap());
    }
}
