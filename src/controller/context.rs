use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::Client;

use crate::config::OperatorConfig;
use crate::health::HealthState;

/// Consecutive failed passes, keyed by the Installation that triggered them
#[derive(Clone, Debug, Default)]
pub struct FailureCounter {
    counts: Arc<Mutex<HashMap<String, u32>>>,
}

impl FailureCounter {
    /// Record a failure for `name` and return the number of failures before it
    pub fn record(&self, name: &str) -> u32 {
        let Ok(mut counts) = self.counts.lock() else {
            return 0;
        };
        let count = counts.entry(name.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn reset(&self, name: &str) {
        if let Ok(mut counts) = self.counts.lock() {
            counts.remove(name);
        }
    }

    /// Number of keys with outstanding failures
    pub fn tracked(&self) -> usize {
        self.counts.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub config: OperatorConfig,
    /// Metrics sink, absent when running without the health server
    pub health_state: Option<Arc<HealthState>>,
    /// Drives the error backoff; recorded and reset under the trigger's name
    failures: FailureCounter,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            config,
            health_state,
            failures: FailureCounter::default(),
        }
    }

    pub fn record_failure(&self, name: &str) -> u32 {
        self.failures.record(name)
    }

    pub fn reset_failures(&self, name: &str) {
        self.failures.reset(name);
    }
}
