//! Integration tests for the connection supervisor.
//!
//! Everything runs against the scripted in-memory transport with the tokio
//! clock paused, so backoff delays are measured exactly.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use grpc_conn::{
    AcquireError, Connection, ConnectivityState, ExponentialBackoff, GrpcDialer, Options,
    Supervisor,
};
use grpc_conn_test_utils::{DialOutcome, MetricEvent, RecordingMetrics, ScriptedDialer};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

fn fixed_retry(delay: Duration) -> impl Fn(u32) -> Duration + Send + Sync + 'static {
    move |_| delay
}

fn test_options(metrics: &RecordingMetrics) -> Options {
    Options::insecure()
        .with_retry(fixed_retry(Duration::from_millis(500)))
        .with_metrics(metrics.sink())
}

fn supervisor(dialer: &ScriptedDialer, options: Options) -> Supervisor<ScriptedDialer> {
    Supervisor::with_dialer(dialer.clone(), "inventory", "inventory:50051", [options]).unwrap()
}

/// Let spawned tasks run without moving the clock by a meaningful amount.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============================================================================
// Acquire
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_acquire_serves_dialed_connection() {
    let dialer = ScriptedDialer::new();
    let metrics = RecordingMetrics::new();
    let supervisor = supervisor(&dialer, test_options(&metrics));
    let shutdown = CancellationToken::new();
    supervisor.start(shutdown.clone()).unwrap();

    let conn = supervisor
        .acquire_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(conn.id(), 1);
    assert_eq!(conn.state(), ConnectivityState::Ready);
    assert_eq!(dialer.dialed_addresses(), vec!["inventory:50051"]);
    assert_eq!(metrics.connected(), Some(true));
    assert!(metrics
        .labels()
        .iter()
        .all(|l| l.service == "inventory" && l.address == "inventory:50051"));

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_acquire_blocks_until_deadline_while_dials_fail() {
    let dialer = ScriptedDialer::always_failing();
    let metrics = RecordingMetrics::new();
    let supervisor = supervisor(&dialer, test_options(&metrics));
    let shutdown = CancellationToken::new();
    supervisor.start(shutdown.clone()).unwrap();

    let started = Instant::now();
    let result = supervisor.acquire_timeout(Duration::from_secs(3)).await;

    assert_eq!(result.unwrap_err(), AcquireError::DeadlineExceeded);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(dialer.dial_count() >= 6, "dials: {}", dialer.dial_count());
    assert!(metrics.attempt_errors() >= 6);
    assert_eq!(metrics.connected(), None);

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_acquire_before_start_never_dials() {
    let dialer = ScriptedDialer::new();
    let supervisor = supervisor(&dialer, Options::insecure());

    let result = supervisor.acquire_timeout(Duration::from_secs(5)).await;

    assert_eq!(result.unwrap_err(), AcquireError::DeadlineExceeded);
    assert_eq!(dialer.dial_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquires_get_same_connection() {
    let dialer = ScriptedDialer::failing_then_succeeding(1);
    let metrics = RecordingMetrics::new();
    let supervisor = supervisor(&dialer, test_options(&metrics));
    let shutdown = CancellationToken::new();
    supervisor.start(shutdown.clone()).unwrap();

    let callers: Vec<_> = (0..50)
        .map(|_| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.acquire_timeout(Duration::from_secs(5)).await })
        })
        .collect();

    let conns: Vec<_> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(conns.len(), 50);
    for conn in &conns {
        assert_eq!(conn.id(), 1);
        assert!(!conn.is_closed());
        assert_eq!(conn.state(), ConnectivityState::Ready);
    }
    assert_eq!(dialer.dial_count(), 2);

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation_does_not_affect_others() {
    let dialer = ScriptedDialer::failing_then_succeeding(1);
    let metrics = RecordingMetrics::new();
    let supervisor = supervisor(&dialer, test_options(&metrics));
    let shutdown = CancellationToken::new();
    supervisor.start(shutdown.clone()).unwrap();

    let caller_token = CancellationToken::new();
    let cancelled = {
        let supervisor = supervisor.clone();
        let caller_token = caller_token.clone();
        tokio::spawn(async move { supervisor.acquire(&caller_token).await })
    };
    let patient = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.acquire_timeout(Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    caller_token.cancel();

    assert_eq!(
        cancelled.await.unwrap().unwrap_err(),
        AcquireError::Cancelled
    );
    assert_eq!(patient.await.unwrap().unwrap().id(), 1);
    assert!(supervisor
        .acquire_timeout(Duration::from_secs(1))
        .await
        .is_ok());
    assert!(!shutdown.is_cancelled());

    shutdown.cancel();
}

// ============================================================================
// Start
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let dialer = ScriptedDialer::new();
    let supervisor = supervisor(&dialer, Options::insecure());
    let clone = supervisor.clone();
    let shutdown = CancellationToken::new();

    assert!(supervisor.start(shutdown.clone()).is_some());
    assert!(supervisor.start(shutdown.clone()).is_none());
    assert!(clone.start(CancellationToken::new()).is_none());
    assert!(clone.is_started());

    supervisor
        .acquire_timeout(Duration::from_secs(1))
        .await
        .unwrap();
    settle().await;

    assert_eq!(dialer.dial_count(), 1);
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_start_launches_one_loop() {
    let dialer = ScriptedDialer::new();
    let supervisor = supervisor(&dialer, Options::insecure());
    let shutdown = CancellationToken::new();

    let starters: Vec<_> = (0..10)
        .map(|_| {
            let supervisor = supervisor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.start(shutdown).is_some() })
        })
        .collect();

    let launched = futures::future::join_all(starters)
        .await
        .into_iter()
        .filter(|joined| *joined.as_ref().unwrap())
        .count();

    assert_eq!(launched, 1);
    supervisor
        .acquire_timeout(Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(dialer.dial_count(), 1);

    shutdown.cancel();
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failures_then_success_counts_attempts() {
    let dialer = ScriptedDialer::failing_then_succeeding(3);
    let metrics = RecordingMetrics::new();
    let supervisor = supervisor(&dialer, test_options(&metrics));
    let shutdown = CancellationToken::new();
    supervisor.start(shutdown.clone()).unwrap();

    let started = Instant::now();
    supervisor
        .acquire_timeout(Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(metrics.attempts(), 4);
    assert_eq!(metrics.attempt_errors(), 3);
    assert_eq!(metrics.connected(), Some(true));
    assert!(started.elapsed() >= Duration::from_millis(1500));
    assert_eq!(metrics.events().first(), Some(&MetricEvent::Registered));

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_backoff_gaps_follow_policy() {
    let dialer = ScriptedDialer::always_failing();
    let metrics = RecordingMetrics::new();
    let options = Options::insecure()
        .with_retry(ExponentialBackoff::default())
        .with_metrics(metrics.sink());
    let supervisor = supervisor(&dialer, options);
    let shutdown = CancellationToken::new();
    let handle = supervisor.start(shutdown.clone()).unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    shutdown.cancel();
    handle.await.unwrap();

    let times = dialer.dial_times();
    assert!(times.len() >= 7, "dials: {}", times.len());

    // Timer granularity is 1ms
    let slack = Duration::from_millis(1);
    let bounds = [
        (Duration::from_millis(1000), Duration::from_millis(1200)),
        (Duration::from_millis(1600), Duration::from_millis(2400)),
        (Duration::from_millis(3200), Duration::from_millis(4800)),
    ];
    for (i, pair) in times.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        let (low, high) = bounds
            .get(i)
            .copied()
            .unwrap_or((Duration::from_secs(4), Duration::from_secs(5)));
        assert!(
            gap >= low && gap <= high + slack,
            "gap {i} was {gap:?}, expected {low:?}..={high:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_bounds_hanging_dial() {
    let dialer = ScriptedDialer::with_outcomes([DialOutcome::Hang], DialOutcome::Succeed);
    let metrics = RecordingMetrics::new();
    let options = test_options(&metrics).with_connect_timeout(Duration::from_secs(2));
    let supervisor = supervisor(&dialer, options);
    let shutdown = CancellationToken::new();
    supervisor.start(shutdown.clone()).unwrap();

    let started = Instant::now();
    supervisor
        .acquire_timeout(Duration::from_secs(10))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(2500));
    assert_eq!(metrics.attempt_errors(), 1);
    assert_eq!(dialer.dial_count(), 2);

    shutdown.cancel();
}

// ============================================================================
// Redial
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_redials_after_transport_shutdown() {
    let dialer = ScriptedDialer::new();
    let metrics = RecordingMetrics::new();
    let supervisor = supervisor(&dialer, test_options(&metrics));
    let shutdown = CancellationToken::new();
    supervisor.start(shutdown.clone()).unwrap();

    let first = supervisor
        .acquire_timeout(Duration::from_secs(1))
        .await
        .unwrap();
    first.simulate_transport_shutdown();

    let second = supervisor
        .acquire_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(first.id(), 1);
    assert_eq!(second.id(), 2);
    assert_eq!(first.close_calls(), 1);
    assert!(!second.is_closed());
    assert_eq!(metrics.attempts(), 2);
    assert_eq!(metrics.attempt_errors(), 0);

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_keeps_serving_connection() {
    let dialer = ScriptedDialer::new();
    let metrics = RecordingMetrics::new();
    let supervisor = supervisor(&dialer, test_options(&metrics));
    let shutdown = CancellationToken::new();
    supervisor.start(shutdown.clone()).unwrap();

    let first = supervisor
        .acquire_timeout(Duration::from_secs(1))
        .await
        .unwrap();
    settle().await;
    first.set_state(ConnectivityState::TransientFailure);
    settle().await;

    let again = supervisor
        .acquire_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(
        metrics.states(),
        vec![ConnectivityState::Ready, ConnectivityState::TransientFailure]
    );

    shutdown.cancel();
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_acquire_after_shutdown_fails_every_time() {
    let dialer = ScriptedDialer::new();
    let metrics = RecordingMetrics::new();
    let supervisor = supervisor(&dialer, test_options(&metrics));
    let shutdown = CancellationToken::new();
    let handle = supervisor.start(shutdown.clone()).unwrap();

    let conn = supervisor
        .acquire_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    shutdown.cancel();
    handle.await.unwrap();

    for _ in 0..3 {
        let err = supervisor
            .acquire(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, AcquireError::ShutdownInProgress);
        assert!(err.is_shutdown());
        assert_eq!(err.to_string(), "Shutdown in progress");
    }

    assert_eq!(conn.close_calls(), 1);
    assert_eq!(conn.state(), ConnectivityState::Shutdown);
    assert_eq!(metrics.connected(), Some(false));
    assert!(supervisor.start(CancellationToken::new()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_acquires_fail_on_shutdown() {
    let dialer = ScriptedDialer::hanging();
    let supervisor = supervisor(&dialer, Options::insecure());
    let shutdown = CancellationToken::new();
    let handle = supervisor.start(shutdown.clone()).unwrap();

    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.acquire(&CancellationToken::new()).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(dialer.dial_count(), 1);

    shutdown.cancel();
    handle.await.unwrap();

    for waiter in waiters {
        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            AcquireError::ShutdownInProgress
        );
    }
    assert!(dialer.connections().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_stops_dialing() {
    let dialer = ScriptedDialer::always_failing();
    let metrics = RecordingMetrics::new();
    let options = test_options(&metrics).with_retry(fixed_retry(Duration::from_secs(60)));
    let supervisor = supervisor(&dialer, options);
    let shutdown = CancellationToken::new();
    let handle = supervisor.start(shutdown.clone()).unwrap();

    settle().await;
    let started = Instant::now();
    shutdown.cancel();
    handle.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(metrics.attempt_errors(), 1);
}

// ============================================================================
// Real transport
// ============================================================================

#[tokio::test]
async fn test_grpc_dialer_unreachable_address_keeps_retrying() {
    let metrics = RecordingMetrics::new();
    let options = Options::insecure()
        .with_connect_timeout(Duration::from_millis(500))
        .with_retry(fixed_retry(Duration::from_millis(50)))
        .with_metrics(metrics.sink());
    let supervisor: Supervisor<GrpcDialer> =
        Supervisor::new("unreachable", "127.0.0.1:1", [options]).unwrap();
    let shutdown = CancellationToken::new();
    let handle = supervisor.start(shutdown.clone()).unwrap();

    let result = supervisor.acquire_timeout(Duration::from_secs(1)).await;

    assert_eq!(result.unwrap_err(), AcquireError::DeadlineExceeded);
    assert!(metrics.attempt_errors() >= 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_tls_preset_unreachable_address_keeps_retrying() {
    let metrics = RecordingMetrics::new();
    let options = Options::default()
        .with_connect_timeout(Duration::from_millis(500))
        .with_retry(fixed_retry(Duration::from_millis(10)))
        .with_metrics(metrics.sink());
    let supervisor = Supervisor::new("inventory", "127.0.0.1:1", [options]).unwrap();
    let shutdown = CancellationToken::new();
    let handle = supervisor.start(shutdown.clone()).unwrap();

    let result = supervisor.acquire_timeout(Duration::from_secs(2)).await;

    assert_eq!(result.unwrap_err(), AcquireError::DeadlineExceeded);
    assert!(metrics.attempt_errors() >= 1);
    assert!(!handle.is_finished(), "reconnect loop exited on its own");

    shutdown.cancel();
    handle.await.unwrap();
}
