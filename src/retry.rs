//! Bounded retry with exponential backoff and dead-letter routing.
//!
//! [`RetryHandler::with_retry`] drives an unreliable operation to completion
//! or exhaustion. Exhausted work is composed into a [`JobFailure`] and written
//! to the origin queue's DLQ; that write is itself guarded by a dedicated
//! circuit breaker so a dead DLQ cannot stall the caller. When the DLQ
//! breaker is open the failure record is emitted in full into the log stream,
//! flagged as data loss, so operators can replay it from logs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::{dlq_name, Broker, OverflowPolicy, ANALYSIS_QUEUE, DETECTION_QUEUE};
use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::error::ServiceError;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Retry policy: total attempts and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first call.
    pub max_retries: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Ceiling applied before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub exponential_base: f64,
    /// Multiply each delay by a uniform factor in `[1.0, 1.25]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay after attempt `attempt` (1-indexed):
    /// `min(base * exponential_base^(attempt-1), max_delay)`, then jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);
        let delayed = if self.jitter {
            capped * rand::rng().random_range(1.0..=1.25)
        } else {
            capped
        };
        Duration::from_secs_f64(delayed)
    }
}

/// Record of a job that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFailure {
    pub original_job: Value,
    pub error: String,
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub queue_name: String,
}

/// Outcome of [`RetryHandler::with_retry`].
#[derive(Debug)]
pub struct RetryResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub attempts: u32,
    pub error: Option<ServiceError>,
    pub moved_to_dlq: bool,
}

/// Per-queue DLQ depths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    pub detection_queue_count: usize,
    pub analysis_queue_count: usize,
    pub total_count: usize,
}

/// Wraps unreliable operations with retry, backoff, and DLQ routing.
pub struct RetryHandler {
    broker: Option<Arc<dyn Broker>>,
    config: RetryConfig,
    dlq_breaker: Arc<CircuitBreaker>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryHandler {
    pub fn new(broker: Option<Arc<dyn Broker>>, config: RetryConfig) -> Self {
        let dlq_breaker =
            Arc::new(CircuitBreaker::new("dlq_writer", BreakerConfig::default()));
        Self::with_dlq_breaker(broker, config, dlq_breaker)
    }

    /// Construct with a caller-owned DLQ breaker (shared registries, tests).
    pub fn with_dlq_breaker(
        broker: Option<Arc<dyn Broker>>,
        config: RetryConfig,
        dlq_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self { broker, config, dlq_breaker, sleeper: Arc::new(TokioSleeper) }
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether the DLQ write path is currently rejecting.
    pub fn is_dlq_circuit_open(&self) -> bool {
        !self.dlq_breaker.allow()
    }

    pub fn dlq_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.dlq_breaker
    }

    /// Run `operation` up to `max_retries` times with backoff between
    /// attempts. On exhaustion the failure is routed to `dlq:<queue_name>`.
    ///
    /// Breaker rejections and other non-retryable errors are surfaced to the
    /// caller after the failing attempt, without DLQ routing.
    pub async fn with_retry<T, Fut, Op>(
        &self,
        mut operation: Op,
        job_payload: &Value,
        queue_name: &str,
    ) -> RetryResult<T>
    where
        T: Send,
        Fut: Future<Output = Result<T, ServiceError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut first_failed_at: Option<DateTime<Utc>> = None;
        let mut last_failed_at = Utc::now();
        let mut last_error: Option<ServiceError> = None;

        for attempt in 1..=max_attempts {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(queue = queue_name, attempt, "operation recovered");
                    }
                    return RetryResult {
                        success: true,
                        value: Some(value),
                        attempts: attempt,
                        error: None,
                        moved_to_dlq: false,
                    };
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(
                        queue = queue_name,
                        attempt,
                        kind = ?e.kind(),
                        error = %e,
                        "non-retryable failure, surfacing to caller"
                    );
                    return RetryResult {
                        success: false,
                        value: None,
                        attempts: attempt,
                        error: Some(e),
                        moved_to_dlq: false,
                    };
                }
                Err(e) => {
                    let now = Utc::now();
                    first_failed_at.get_or_insert(now);
                    last_failed_at = now;
                    tracing::warn!(
                        queue = queue_name,
                        attempt,
                        max_attempts,
                        kind = ?e.kind(),
                        error = %e,
                        "attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        self.sleeper.sleep(self.config.delay_for(attempt)).await;
                    }
                }
            }
        }

        let error = match last_error {
            Some(e) => e,
            // max_attempts >= 1, so the loop recorded an error before exiting.
            None => ServiceError::Other("retry loop exited without an error".into()),
        };

        let failure = JobFailure {
            original_job: job_payload.clone(),
            error: error.to_string(),
            attempt_count: max_attempts,
            first_failed_at: first_failed_at.unwrap_or(last_failed_at),
            last_failed_at,
            queue_name: queue_name.to_string(),
        };
        let moved_to_dlq = self.push_to_dlq(&failure).await;

        RetryResult {
            success: false,
            value: None,
            attempts: max_attempts,
            error: Some(error),
            moved_to_dlq,
        }
    }

    async fn push_to_dlq(&self, failure: &JobFailure) -> bool {
        let Some(broker) = self.broker.clone() else {
            tracing::warn!(
                queue = %failure.queue_name,
                "no broker configured, job failure not persisted"
            );
            return false;
        };

        let dlq = dlq_name(&failure.queue_name);
        let payload = match serde_json::to_value(failure) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(queue = %dlq, error = %e, "failed to encode job failure");
                return false;
            }
        };

        let write = self
            .dlq_breaker
            .call(|| {
                let broker = broker.clone();
                let dlq = dlq.clone();
                let payload = payload.clone();
                async move {
                    let receipt =
                        broker.safe_enqueue(&dlq, payload, OverflowPolicy::Dlq).await?;
                    if receipt.success {
                        Ok(receipt.queue_length)
                    } else {
                        Err(ServiceError::Broker(
                            receipt.error.unwrap_or_else(|| "enqueue rejected".into()),
                        ))
                    }
                }
            })
            .await;

        match write {
            Ok(depth) => {
                tracing::info!(queue = %dlq, dlq_depth = depth, "job failure moved to DLQ");
                true
            }
            Err(e) if e.is_circuit_open() => {
                tracing::error!(
                    queue = %dlq,
                    failure = %payload,
                    "CRITICAL DATA LOSS: DLQ circuit is open and the job failure \
                     could not be persisted; recover it from this record"
                );
                false
            }
            Err(e) => {
                tracing::error!(queue = %dlq, error = %e, "failed to write job failure to DLQ");
                false
            }
        }
    }

    /// Depths of the detection and analysis DLQs.
    pub async fn dlq_stats(&self) -> DlqStats {
        let Some(broker) = &self.broker else {
            return DlqStats::default();
        };

        let detection = self.queue_length_or_zero(broker, &dlq_name(DETECTION_QUEUE)).await;
        let analysis = self.queue_length_or_zero(broker, &dlq_name(ANALYSIS_QUEUE)).await;
        DlqStats {
            detection_queue_count: detection,
            analysis_queue_count: analysis,
            total_count: detection + analysis,
        }
    }

    async fn queue_length_or_zero(&self, broker: &Arc<dyn Broker>, queue: &str) -> usize {
        match broker.queue_length(queue).await {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!(queue, error = %e, "failed to read DLQ depth");
                0
            }
        }
    }

    /// Non-destructive read of up to `limit` failure records from a DLQ.
    /// Malformed records are skipped.
    pub async fn dlq_jobs(&self, queue: &str, limit: usize) -> Vec<JobFailure> {
        let Some(broker) = &self.broker else {
            return Vec::new();
        };

        let dlq = dlq_name(queue);
        let raw = match broker.peek(&dlq, limit).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(queue = %dlq, error = %e, "failed to peek DLQ");
                return Vec::new();
            }
        };

        raw.into_iter()
            .filter_map(|value| match serde_json::from_value::<JobFailure>(value) {
                Ok(failure) => Some(failure),
                Err(e) => {
                    tracing::warn!(queue = %dlq, error = %e, "skipping malformed DLQ record");
                    None
                }
            })
            .collect()
    }

    /// Pop one record from `dlq_queue` and enqueue its original job into
    /// `origin_queue`. On enqueue failure the record is put back and `false`
    /// is returned.
    pub async fn move_dlq_job(&self, dlq_queue: &str, origin_queue: &str) -> bool {
        let Some(broker) = self.broker.clone() else {
            return false;
        };

        let dlq = dlq_name(dlq_queue);
        let record = match broker.nonblocking_pop(&dlq).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                tracing::error!(queue = %dlq, error = %e, "failed to pop DLQ record");
                return false;
            }
        };

        let original_job = match serde_json::from_value::<JobFailure>(record.clone()) {
            Ok(failure) => failure.original_job,
            Err(e) => {
                tracing::error!(queue = %dlq, error = %e, "undecodable DLQ record, putting back");
                self.put_back(&broker, &dlq, record).await;
                return false;
            }
        };

        match broker.safe_enqueue(origin_queue, original_job, OverflowPolicy::Dlq).await {
            Ok(receipt) if receipt.success => {
                tracing::info!(from = %dlq, to = origin_queue, "DLQ job requeued");
                true
            }
            Ok(receipt) => {
                tracing::error!(
                    from = %dlq,
                    to = origin_queue,
                    error = receipt.error.as_deref().unwrap_or("enqueue rejected"),
                    "requeue failed, putting record back"
                );
                self.put_back(&broker, &dlq, record).await;
                false
            }
            Err(e) => {
                tracing::error!(from = %dlq, to = origin_queue, error = %e, "requeue failed, putting record back");
                self.put_back(&broker, &dlq, record).await;
                false
            }
        }
    }

    /// Delete every record in a DLQ.
    pub async fn clear_dlq(&self, queue: &str) -> bool {
        let Some(broker) = &self.broker else {
            return false;
        };
        let dlq = dlq_name(queue);
        match broker.clear(&dlq).await {
            Ok(cleared) => cleared,
            Err(e) => {
                tracing::error!(queue = %dlq, error = %e, "failed to clear DLQ");
                false
            }
        }
    }

    async fn put_back(&self, broker: &Arc<dyn Broker>, dlq: &str, record: Value) {
        match broker.safe_enqueue(dlq, record, OverflowPolicy::Dlq).await {
            Ok(receipt) if receipt.success => {}
            Ok(receipt) => {
                tracing::error!(
                    queue = %dlq,
                    error = receipt.error.as_deref().unwrap_or("enqueue rejected"),
                    "failed to restore DLQ record"
                );
            }
            Err(e) => {
                tracing::error!(queue = %dlq, error = %e, "failed to restore DLQ record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(2));
        assert_eq!(config.delay_for(3), Duration::from_secs(4));
        assert_eq!(config.delay_for(4), Duration::from_secs(5));
        assert_eq!(config.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn delay_with_custom_base() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(500),
            exponential_base: 3.0,
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(500));
        assert_eq!(config.delay_for(2), Duration::from_millis(1500));
        assert_eq!(config.delay_for(3), Duration::from_millis(4500));
    }

    #[test]
    fn jitter_stays_within_a_quarter_above_base() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(1),
            exponential_base: 2.0,
            jitter: true,
            ..RetryConfig::default()
        };
        for _ in 0..100 {
            let delay = config.delay_for(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let handler = RetryHandler::new(None, fast_config()).with_sleeper(InstantSleeper);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = handler
            .with_retry(
                || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ServiceError>("done")
                    }
                },
                &json!({"camera_id": "cam1"}),
                DETECTION_QUEUE,
            )
            .await;

        assert!(result.success);
        assert_eq!(result.value, Some("done"));
        assert_eq!(result.attempts, 1);
        assert!(!result.moved_to_dlq);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let handler = RetryHandler::new(None, fast_config()).with_sleeper(InstantSleeper);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = handler
            .with_retry(
                || {
                    let calls = calls_clone.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(ServiceError::ConnectRefused)
                        } else {
                            Ok(7)
                        }
                    }
                },
                &json!({}),
                DETECTION_QUEUE,
            )
            .await;

        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error() {
        let handler = RetryHandler::new(None, fast_config()).with_sleeper(InstantSleeper);

        let result: RetryResult<()> = handler
            .with_retry(
                || async { Err(ServiceError::Other("boom".into())) },
                &json!({"id": 7}),
                DETECTION_QUEUE,
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.error, Some(ServiceError::Other("boom".into())));
        // No broker configured, so the failure cannot reach a DLQ.
        assert!(!result.moved_to_dlq);
    }

    #[tokio::test]
    async fn backoff_delays_follow_the_schedule() {
        let sleeper = TrackingSleeper::new();
        let handler =
            RetryHandler::new(None, fast_config()).with_sleeper(sleeper.clone());

        let _: RetryResult<()> = handler
            .with_retry(
                || async { Err(ServiceError::Other("boom".into())) },
                &json!({}),
                DETECTION_QUEUE,
            )
            .await;

        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[tokio::test]
    async fn circuit_open_is_not_retried() {
        let handler = RetryHandler::new(None, fast_config()).with_sleeper(InstantSleeper);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: RetryResult<()> = handler
            .with_retry(
                || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(ServiceError::CircuitOpen {
                            name: "detector".into(),
                            state: crate::circuit_breaker::CircuitState::Open,
                        })
                    }
                },
                &json!({}),
                DETECTION_QUEUE,
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert!(!result.moved_to_dlq);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_errors_are_surfaced_without_retry() {
        let handler = RetryHandler::new(None, fast_config()).with_sleeper(InstantSleeper);

        let result: RetryResult<()> = handler
            .with_retry(
                || async { Err(ServiceError::Client(400)) },
                &json!({}),
                ANALYSIS_QUEUE,
            )
            .await;

        assert_eq!(result.attempts, 1);
        assert_eq!(result.error, Some(ServiceError::Client(400)));
        assert!(!result.moved_to_dlq);
    }

    #[test]
    fn job_failure_round_trips_through_json() {
        let failure = JobFailure {
            original_job: json!({"camera_id": "cam1"}),
            error: "connection refused".into(),
            attempt_count: 3,
            first_failed_at: Utc::now(),
            last_failed_at: Utc::now(),
            queue_name: DETECTION_QUEUE.into(),
        };
        let value = serde_json::to_value(&failure).unwrap();
        let back: JobFailure = serde_json::from_value(value).unwrap();
        assert_eq!(back, failure);
    }
}
