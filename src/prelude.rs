//! Convenient re-exports for common Nightwatch types.
pub use crate::{
    ai_fallback::{AiFallbackService, AiService, DegradationLevel, ModelStatus},
    breaker_registry::BreakerRegistry,
    broker::{dlq_name, Broker, EnqueueReceipt, OverflowPolicy, ANALYSIS_QUEUE, DETECTION_QUEUE},
    circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState},
    config::CoreConfig,
    degradation::{probe_fn, DegradationManager, DegradationMode, DegradationOptions},
    error::{ErrorKind, ServiceError},
    fallback_queue::FallbackQueue,
    health::{HealthAggregator, HealthView, ModelEndpoint, ModelProber, OverallStatus},
    retry::{JobFailure, RetryConfig, RetryHandler, RetryResult},
};
