//! Metrics sink that records calls in order.

use grpc_conn::{ConnectionMetrics, ConnectivityState, MetricLabels};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
    Registered,
    Attempt,
    AttemptError,
    Connected(bool),
    State(ConnectivityState),
}

/// Records every [`ConnectionMetrics`] call with its labels.
#[derive(Debug, Clone, Default)]
pub struct RecordingMetrics {
    events: Arc<Mutex<Vec<(MetricLabels, MetricEvent)>>>,
}

impl RecordingMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The sink to pass to `Options::with_metrics`.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn ConnectionMetrics> {
        Arc::new(self.clone())
    }

    #[must_use]
    pub fn events(&self) -> Vec<MetricEvent> {
        self.lock().iter().map(|(_, event)| event.clone()).collect()
    }

    #[must_use]
    pub fn labels(&self) -> Vec<MetricLabels> {
        self.lock().iter().map(|(labels, _)| labels.clone()).collect()
    }

    /// Value of the attempts counter.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.count(&MetricEvent::Attempt)
    }

    /// Value of the attempt error counter.
    #[must_use]
    pub fn attempt_errors(&self) -> usize {
        self.count(&MetricEvent::AttemptError)
    }

    /// Every state written to the state gauge, in order.
    #[must_use]
    pub fn states(&self) -> Vec<ConnectivityState> {
        self.lock()
            .iter()
            .filter_map(|(_, event)| match event {
                MetricEvent::State(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Last value written to the connected gauge.
    #[must_use]
    pub fn connected(&self) -> Option<bool> {
        self.lock().iter().rev().find_map(|(_, event)| match event {
            MetricEvent::Connected(connected) => Some(*connected),
            _ => None,
        })
    }

    fn count(&self, wanted: &MetricEvent) -> usize {
        self.lock().iter().filter(|(_, event)| event == wanted).count()
    }

    fn push(&self, labels: &MetricLabels, event: MetricEvent) {
        self.lock().push((labels.clone(), event));
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(MetricLabels, MetricEvent)>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionMetrics for RecordingMetrics {
    fn register(&self, labels: &MetricLabels) {
        self.push(labels, MetricEvent::Registered);
    }

    fn record_attempt(&self, labels: &MetricLabels) {
        self.push(labels, MetricEvent::Attempt);
    }

    fn record_attempt_error(&self, labels: &MetricLabels) {
        self.push(labels, MetricEvent::AttemptError);
    }

    fn set_connected(&self, labels: &MetricLabels, connected: bool) {
        self.push(labels, MetricEvent::Connected(connected));
    }

    fn set_state(&self, labels: &MetricLabels, state: ConnectivityState) {
        self.push(labels, MetricEvent::State(state));
    }
}
