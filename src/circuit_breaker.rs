//! Circuit breaker guarding one remote call site.
//!
//! State machine:
//!
//! - `Closed`: calls pass. A success zeroes the failure counter; a countable
//!   failure increments it, and reaching `failure_threshold` opens the
//!   circuit.
//! - `Open`: calls are rejected with [`ServiceError::CircuitOpen`]. Once
//!   `recovery_timeout` has elapsed since the last failure, the next call
//!   moves the breaker to `HalfOpen` and is admitted as a trial.
//! - `HalfOpen`: at most `half_open_max_calls` trial calls may be in flight.
//!   Any countable failure reopens the circuit; `success_threshold`
//!   successes close it.
//!
//! Error kinds listed in [`BreakerConfig::excluded_kinds`] are never counted
//! and never move state, in any state. All counter and state mutation is
//! serialized by one internal mutex; the guarded operation itself runs with
//! the lock released.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ErrorKind, ServiceError};

/// Breaker state, in the order calls experience it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Configuration for one breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Countable failures in `Closed` before the circuit opens.
    pub failure_threshold: u32,
    /// Successes in `HalfOpen` before the circuit closes.
    pub success_threshold: u32,
    /// Time to stay `Open` before admitting a trial call.
    pub recovery_timeout: Duration,
    /// Concurrent trial calls admitted in `HalfOpen`.
    pub half_open_max_calls: u32,
    /// Error kinds that never count as failures and never move state.
    pub excluded_kinds: Vec<ErrorKind>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            excluded_kinds: vec![ErrorKind::Client],
        }
    }
}

/// Consistent point-in-time copy of a breaker's counters.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_inflight: u32,
    total_calls: u64,
    rejected_calls: u64,
    // Monotonic stamp used for recovery decisions; the wall-clock twins below
    // are informational only.
    last_failure_millis: Option<u64>,
    last_failure_at: Option<DateTime<Utc>>,
    last_transition_at: Option<DateTime<Utc>>,
}

/// Circuit breaker for a single named dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, MonotonicClock::default())
    }

    /// Construct with a caller-provided clock (deterministic tests).
    pub fn with_clock(
        name: impl Into<String>,
        mut config: BreakerConfig,
        clock: impl Clock + 'static,
    ) -> Self {
        let name = name.into();
        if config.failure_threshold == 0 || config.success_threshold == 0 {
            tracing::warn!(breaker = %name, "breaker thresholds must be >= 1, clamping");
            config.failure_threshold = config.failure_threshold.max(1);
            config.success_threshold = config.success_threshold.max(1);
        }
        config.half_open_max_calls = config.half_open_max_calls.max(1);

        tracing::info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            "circuit breaker initialized"
        );

        Self {
            name,
            config,
            clock: Arc::new(clock),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_inflight: 0,
                total_calls: 0,
                rejected_calls: 0,
                last_failure_millis: None,
                last_failure_at: None,
                last_transition_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call would currently be admitted.
    ///
    /// Performs the `Open -> HalfOpen` transition when the recovery timeout
    /// has elapsed, so a `true` answer reflects the state an immediate call
    /// would see. Does not count the call; [`CircuitBreaker::call`] does.
    pub fn allow(&self) -> bool {
        let mut s = self.lock();
        self.admit(&mut s)
    }

    /// Record a successful call against the current state.
    pub fn record_success(&self) {
        let mut s = self.lock();
        self.on_success(&mut s);
    }

    /// Record a failed call against the current state.
    pub fn record_failure(&self) {
        let mut s = self.lock();
        self.on_failure(&mut s);
    }

    /// Execute `operation` under breaker protection.
    ///
    /// Rejected calls return [`ServiceError::CircuitOpen`] without invoking
    /// the operation. Errors whose kind is excluded are surfaced to the
    /// caller but recorded as neither success nor failure.
    pub async fn call<T, Fut, Op>(&self, operation: Op) -> Result<T, ServiceError>
    where
        Fut: Future<Output = Result<T, ServiceError>>,
        Op: FnOnce() -> Fut,
    {
        let trial = {
            let mut s = self.lock();
            s.total_calls += 1;
            if !self.admit(&mut s) {
                s.rejected_calls += 1;
                return Err(ServiceError::CircuitOpen {
                    name: self.name.clone(),
                    state: s.state,
                });
            }
            let trial = s.state == CircuitState::HalfOpen;
            if trial {
                s.half_open_inflight += 1;
            }
            trial
        };

        let result = operation().await;

        let mut s = self.lock();
        if trial {
            s.half_open_inflight = s.half_open_inflight.saturating_sub(1);
        }
        match &result {
            Ok(_) => self.on_success(&mut s),
            Err(e) if self.is_excluded(e) => {
                tracing::debug!(breaker = %self.name, kind = ?e.kind(), "excluded error, not counted");
            }
            Err(_) => self.on_failure(&mut s),
        }
        result
    }

    /// Force the circuit open (maintenance / manual intervention).
    pub fn force_open(&self) {
        tracing::warn!(breaker = %self.name, "circuit breaker force-opened");
        let mut s = self.lock();
        self.transition(&mut s, CircuitState::Open);
        s.last_failure_millis = Some(self.clock.now_millis());
        s.last_failure_at = Some(Utc::now());
    }

    /// Reset to `Closed`, zeroing every counter except `total_calls`.
    pub fn reset(&self) {
        tracing::info!(breaker = %self.name, "circuit breaker reset");
        let mut s = self.lock();
        s.state = CircuitState::Closed;
        s.failure_count = 0;
        s.success_count = 0;
        s.half_open_inflight = 0;
        s.rejected_calls = 0;
        s.last_transition_at = Some(Utc::now());
    }

    /// Consistent snapshot of the breaker's counters.
    pub fn snapshot(&self) -> BreakerMetrics {
        let s = self.lock();
        BreakerMetrics {
            name: self.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
            total_calls: s.total_calls,
            rejected_calls: s.rejected_calls,
            last_failure_at: s.last_failure_at,
            last_transition_at: s.last_transition_at,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_excluded(&self, err: &ServiceError) -> bool {
        self.config.excluded_kinds.contains(&err.kind())
    }

    // Transition logic runs before admission: a call arriving after the
    // recovery timeout moves Open -> HalfOpen and then competes on the
    // half-open in-flight budget.
    fn admit(&self, s: &mut BreakerState) -> bool {
        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_ok = match s.last_failure_millis {
                    Some(at) => {
                        let now = self.clock.now_millis();
                        now.saturating_sub(at) >= self.config.recovery_timeout.as_millis() as u64
                    }
                    None => true,
                };
                if elapsed_ok {
                    self.transition(s, CircuitState::HalfOpen);
                    s.half_open_inflight < self.config.half_open_max_calls
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => s.half_open_inflight < self.config.half_open_max_calls,
        }
    }

    fn on_success(&self, s: &mut BreakerState) {
        match s.state {
            CircuitState::Closed => {
                s.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                s.success_count += 1;
                if s.success_count >= self.config.success_threshold {
                    self.transition(s, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, s: &mut BreakerState) {
        s.failure_count += 1;
        s.last_failure_millis = Some(self.clock.now_millis());
        s.last_failure_at = Some(Utc::now());

        match s.state {
            CircuitState::Closed => {
                if s.failure_count >= self.config.failure_threshold {
                    self.transition(s, CircuitState::Open);
                }
            }
            // Any countable failure during the trial period reopens.
            CircuitState::HalfOpen => self.transition(s, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn transition(&self, s: &mut BreakerState, new_state: CircuitState) {
        if s.state == new_state {
            return;
        }
        let old_state = s.state;
        s.state = new_state;
        s.last_transition_at = Some(Utc::now());

        match new_state {
            CircuitState::HalfOpen => {
                s.half_open_inflight = 0;
                s.success_count = 0;
            }
            CircuitState::Closed => {
                s.failure_count = 0;
                s.success_count = 0;
            }
            CircuitState::Open => {}
        }

        tracing::info!(
            breaker = %self.name,
            from = %old_state,
            to = %new_state,
            failure_count = s.failure_count,
            "circuit breaker state changed"
        );
    }
}
