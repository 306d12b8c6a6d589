//! Registry of named circuit breakers.
//!
//! The process root owns one registry; everything else holds breaker names
//! and looks them up here. Components never share `Arc`s to each other's
//! breakers directly, which keeps the ownership graph acyclic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{BreakerConfig, BreakerMetrics, CircuitBreaker, CircuitState};

/// Registry keyed by breaker name.
#[derive(Default, Debug)]
pub struct BreakerRegistry {
    inner: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the breaker registered under `name`, creating it with `config`
    /// if absent. An existing breaker wins; the new config is ignored.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = self.lock();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Look up a breaker without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Current state of every registered breaker, sorted by name.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let map = self.lock();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Metrics snapshot of every registered breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerMetrics> {
        let map = self.lock();
        let mut entries: Vec<BreakerMetrics> = map.values().map(|b| b.snapshot()).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Drop every registered breaker. Intended for tests; production code
    /// resets individual breakers instead.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
