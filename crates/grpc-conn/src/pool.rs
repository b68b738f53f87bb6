//! Name-keyed registry of supervisors.
//!
//! Built once, then read-only. Lookups never touch the network and never
//! start anything; use [`Pool::start_all`] (or start supervisors
//! individually) before acquiring.

use crate::supervisor::Supervisor;
use crate::transport::grpc::GrpcDialer;
use crate::transport::Dialer;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Immutable mapping from connection name to [`Supervisor`].
#[derive(Debug, Clone)]
pub struct Pool<D: Dialer = GrpcDialer> {
    supervisors: HashMap<String, Supervisor<D>>,
}

impl<D: Dialer> Pool<D> {
    /// Build a pool keyed by each supervisor's name.
    ///
    /// If two supervisors share a name the later one wins.
    pub fn new(supervisors: impl IntoIterator<Item = Supervisor<D>>) -> Self {
        let mut map = HashMap::new();
        for supervisor in supervisors {
            let name = supervisor.name().to_string();
            if let Some(replaced) = map.insert(name, supervisor) {
                warn!(
                    target: "grpc_conn.pool",
                    name = %replaced.name(),
                    replaced_address = %replaced.address(),
                    "Duplicate connection name, keeping the last one"
                );
            }
        }
        Self { supervisors: map }
    }

    /// Look up a supervisor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Supervisor<D>> {
        self.supervisors.get(name)
    }

    /// Number of distinct names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    /// Whether no supervisor is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.supervisors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// `(name, supervisor)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Supervisor<D>)> {
        self.supervisors
            .iter()
            .map(|(name, supervisor)| (name.as_str(), supervisor))
    }

    /// Start every supervisor that has not been started yet.
    ///
    /// Returns the handles of the loops launched by this call.
    pub fn start_all(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.supervisors
            .values()
            .filter_map(|supervisor| supervisor.start(shutdown.clone()))
            .collect()
    }
}
