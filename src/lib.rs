#![forbid(unsafe_code)]

//! # Nightwatch
//!
//! Resilience core for an AI security backend: the state machines and
//! policies that decide *whether to call, how to retry, where failed work
//! goes, and what the system reports about itself* when the model fleet, the
//! message broker, or the store misbehaves.
//!
//! ## Components
//!
//! - **Circuit breakers** ([`CircuitBreaker`], [`BreakerRegistry`]) gate each
//!   remote call site, trip on repeated failure, and test recovery through a
//!   half-open trial budget.
//! - **Retry handling** ([`RetryHandler`]) wraps unreliable operations with
//!   bounded exponential backoff and routes exhausted work to a dead-letter
//!   queue; the DLQ write path is itself circuit-protected.
//! - **Degradation management** ([`DegradationManager`]) aggregates service
//!   probes into an operating mode, queues work to disk while the broker is
//!   down ([`FallbackQueue`]), and drains it back on recovery.
//! - **AI fallbacks** ([`AiFallbackService`]) publish per-model availability
//!   and return deterministic outputs (cached or heuristic risk scores,
//!   synthesized captions, zero-vector embeddings) when a model is out.
//! - **Health aggregation** ([`HealthAggregator`]) assembles the
//!   operator-facing status view.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nightwatch::{BreakerConfig, BreakerRegistry, ServiceError};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(BreakerRegistry::new());
//!     let breaker = registry.get_or_create(
//!         "detector",
//!         BreakerConfig {
//!             failure_threshold: 3,
//!             recovery_timeout: Duration::from_secs(30),
//!             ..BreakerConfig::default()
//!         },
//!     );
//!
//!     let result = breaker
//!         .call(|| async { Ok::<_, ServiceError>("detections") })
//!         .await;
//!     assert_eq!(result.unwrap(), "detections");
//! }
//! ```

mod ai_fallback;
mod breaker_registry;
mod broker;
mod circuit_breaker;
mod clock;
mod config;
mod degradation;
mod error;
mod fallback_queue;
mod health;
mod retry;
mod sleeper;

// Re-exports
pub use ai_fallback::{
    callback_fn, default_breaker_config, object_type_score, AiFallbackService, AiService,
    AiStatus, DegradationLevel, FallbackRiskAnalysis, ModelState, ModelStatus, RiskSource,
    StatusCallback,
};
pub use breaker_registry::BreakerRegistry;
pub use broker::{
    dlq_name, Broker, EnqueueReceipt, OverflowPolicy, ANALYSIS_QUEUE, DETECTION_QUEUE,
};
pub use circuit_breaker::{BreakerConfig, BreakerMetrics, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    AiSettings, BreakerSettings, CoreConfig, DegradationSettings, FallbackQueueSettings,
    RetrySettings,
};
pub use degradation::{
    probe_fn, DegradationManager, DegradationMode, DegradationOptions, DegradationStatus,
    HealthProbe, HealthStatus, QueuedJob, ServiceHealth, DEFERRED_JOBS_QUEUE,
};
pub use error::{ErrorKind, ServiceError};
pub use fallback_queue::FallbackQueue;
pub use health::{
    HealthAggregator, HealthView, ModelEndpoint, ModelHealthDetail, ModelProber, OverallStatus,
    ProbeStatus, QueueDepthInfo, QueueDepths, MODEL_PROBE_TIMEOUT,
};
pub use retry::{DlqStats, JobFailure, RetryConfig, RetryHandler, RetryResult};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

pub mod prelude;
