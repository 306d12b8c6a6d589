//! Degradation manager: service health probes, operating mode, and the
//! broker-or-disk enqueue path.
//!
//! Services register a probe and a criticality flag. A periodic loop runs
//! every probe under a timeout, folds the results into per-service health,
//! and recomputes the system-wide [`DegradationMode`]. Work submission goes
//! through [`DegradationManager::enqueue`], which prefers the broker and
//! falls back to the per-queue disk FIFO; a bounded in-memory ring holds
//! typed operational jobs. When the broker recovers, queued work drains back
//! FIFO, stopping at the first failed hand-off.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::broker::{Broker, OverflowPolicy};
use crate::error::ServiceError;
use crate::fallback_queue::FallbackQueue;

/// Broker queue holding operational jobs deferred while degraded.
pub const DEFERRED_JOBS_QUEUE: &str = "degraded:jobs";

/// Async health probe: `Ok(true)` means healthy, anything else is a failure.
pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, Result<bool, ServiceError>> + Send + Sync>;

/// Wrap a plain async closure as a [`HealthProbe`].
pub fn probe_fn<F, Fut>(f: F) -> HealthProbe
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, ServiceError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Probe-derived health of one registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Health record for a monitored service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub error_message: Option<String>,
}

impl ServiceHealth {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unknown,
            last_check_at: None,
            last_success_at: None,
            consecutive_failures: 0,
            error_message: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

struct RegisteredService {
    probe: HealthProbe,
    critical: bool,
    health: ServiceHealth,
}

/// System-wide operating mode, ordered from full capability down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationMode {
    Normal,
    Degraded,
    Minimal,
    Offline,
}

impl std::fmt::Display for DegradationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DegradationMode::Normal => "normal",
            DegradationMode::Degraded => "degraded",
            DegradationMode::Minimal => "minimal",
            DegradationMode::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Typed operational job held for later processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_type: String,
    pub payload: Value,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueuedJob {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self { job_type: job_type.into(), payload, queued_at: Utc::now(), retry_count: 0 }
    }
}

/// Tunables for the manager.
#[derive(Debug, Clone)]
pub struct DegradationOptions {
    /// Consecutive probe failures before a service counts against the mode.
    pub failure_threshold: u32,
    /// Consecutive broker pings required to declare the broker recovered.
    pub recovery_threshold: u32,
    /// Probe loop interval.
    pub check_interval: Duration,
    /// Per-probe timeout; expiry counts as a failure.
    pub probe_timeout: Duration,
    /// In-memory job ring capacity; overflow drops the oldest job.
    pub memory_queue_max: usize,
    /// Root directory for the per-queue disk fallback.
    pub fallback_dir: PathBuf,
    /// Max entries per disk fallback queue.
    pub fallback_queue_max: usize,
}

impl Default for DegradationOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
            check_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(10),
            memory_queue_max: 1000,
            fallback_dir: PathBuf::from("fallback_queues"),
            fallback_queue_max: 10_000,
        }
    }
}

/// Operator-facing summary of the manager's state.
#[derive(Debug, Clone, Serialize)]
pub struct DegradationStatus {
    pub mode: DegradationMode,
    pub is_degraded: bool,
    pub broker_healthy: bool,
    pub memory_queue_size: usize,
    pub fallback_queues: BTreeMap<String, usize>,
    pub services: BTreeMap<String, ServiceHealth>,
    pub available_features: Vec<String>,
}

struct ManagerState {
    mode: DegradationMode,
    services: BTreeMap<String, RegisteredService>,
    memory_queue: VecDeque<QueuedJob>,
    broker_healthy: bool,
    broker_recovery_streak: u32,
    fallback_queues: HashMap<String, Arc<FallbackQueue>>,
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Orchestrates graceful degradation during partial outages.
pub struct DegradationManager {
    broker: Option<Arc<dyn Broker>>,
    options: DegradationOptions,
    inner: Mutex<ManagerState>,
    lifecycle: std::sync::Mutex<Option<LoopHandle>>,
}

impl DegradationManager {
    pub fn new(broker: Option<Arc<dyn Broker>>, options: DegradationOptions) -> Self {
        if let Err(e) = std::fs::create_dir_all(&options.fallback_dir) {
            tracing::error!(
                dir = %options.fallback_dir.display(),
                error = %e,
                "failed to create fallback root directory"
            );
        }

        tracing::info!(
            failure_threshold = options.failure_threshold,
            recovery_threshold = options.recovery_threshold,
            check_interval_s = options.check_interval.as_secs_f64(),
            fallback_dir = %options.fallback_dir.display(),
            "degradation manager initialized"
        );

        Self {
            broker,
            options,
            inner: Mutex::new(ManagerState {
                mode: DegradationMode::Normal,
                services: BTreeMap::new(),
                memory_queue: VecDeque::new(),
                // Assume healthy until a ping says otherwise.
                broker_healthy: true,
                broker_recovery_streak: 0,
                fallback_queues: HashMap::new(),
            }),
            lifecycle: std::sync::Mutex::new(None),
        }
    }

    pub fn options(&self) -> &DegradationOptions {
        &self.options
    }

    /// Register a service for periodic health monitoring.
    pub async fn register_service(&self, name: &str, probe: HealthProbe, critical: bool) {
        let mut state = self.inner.lock().await;
        state.services.insert(
            name.to_string(),
            RegisteredService { probe, critical, health: ServiceHealth::new(name) },
        );
        tracing::info!(service = name, critical, "service registered for monitoring");
    }

    pub async fn list_services(&self) -> Vec<String> {
        self.inner.lock().await.services.keys().cloned().collect()
    }

    pub async fn service_health(&self, name: &str) -> Option<ServiceHealth> {
        self.inner.lock().await.services.get(name).map(|s| s.health.clone())
    }

    pub async fn is_service_healthy(&self, name: &str) -> bool {
        self.inner
            .lock()
            .await
            .services
            .get(name)
            .is_some_and(|s| s.health.is_healthy())
    }

    pub async fn mode(&self) -> DegradationMode {
        self.inner.lock().await.mode
    }

    pub async fn is_degraded(&self) -> bool {
        self.inner.lock().await.mode != DegradationMode::Normal
    }

    /// Whether new work is still accepted (even if only for queueing).
    pub async fn is_accepting_jobs(&self) -> bool {
        self.inner.lock().await.mode != DegradationMode::Offline
    }

    /// Whether jobs should be deferred instead of processed inline.
    pub async fn should_queue_jobs(&self) -> bool {
        self.inner.lock().await.mode != DegradationMode::Normal
    }

    pub async fn broker_is_healthy(&self) -> bool {
        self.inner.lock().await.broker_healthy
    }

    /// Fold one probe outcome into a service's health and re-evaluate mode.
    pub async fn update_service_health(
        &self,
        name: &str,
        is_healthy: bool,
        error_message: Option<String>,
    ) {
        let mut state = self.inner.lock().await;
        let Some(service) = state.services.get_mut(name) else {
            tracing::warn!(service = name, "health update for unregistered service");
            return;
        };

        let now = Utc::now();
        service.health.last_check_at = Some(now);
        if is_healthy {
            service.health.status = HealthStatus::Healthy;
            service.health.last_success_at = Some(now);
            service.health.consecutive_failures = 0;
            service.health.error_message = None;
        } else {
            service.health.status = HealthStatus::Unhealthy;
            service.health.consecutive_failures += 1;
            tracing::warn!(
                service = name,
                consecutive_failures = service.health.consecutive_failures,
                error = error_message.as_deref().unwrap_or("unknown"),
                "service unhealthy"
            );
            service.health.error_message = error_message;
        }

        self.evaluate_mode(&mut state);
    }

    /// Run every registered probe once, each bounded by the probe timeout.
    pub async fn run_probes(&self) {
        let probes: Vec<(String, HealthProbe)> = {
            let state = self.inner.lock().await;
            state
                .services
                .iter()
                .map(|(name, service)| (name.clone(), service.probe.clone()))
                .collect()
        };

        for (name, probe) in probes {
            let outcome = tokio::time::timeout(self.options.probe_timeout, probe()).await;
            match outcome {
                Ok(Ok(true)) => self.update_service_health(&name, true, None).await,
                Ok(Ok(false)) => {
                    self.update_service_health(&name, false, Some("probe returned false".into()))
                        .await
                }
                Ok(Err(e)) => self.update_service_health(&name, false, Some(e.to_string())).await,
                Err(_) => {
                    let message = format!(
                        "health probe timed out after {:?}",
                        self.options.probe_timeout
                    );
                    tracing::error!(service = %name, "{message}");
                    self.update_service_health(&name, false, Some(message)).await;
                }
            }
        }
    }

    fn evaluate_mode(&self, state: &mut ManagerState) {
        let threshold = self.options.failure_threshold;
        let mut critical_total = 0u32;
        let mut critical_bad = 0u32;
        let mut non_critical_bad = 0u32;

        for service in state.services.values() {
            let bad = service.health.consecutive_failures >= threshold;
            if service.critical {
                critical_total += 1;
                if bad {
                    critical_bad += 1;
                }
            } else if bad {
                non_critical_bad += 1;
            }
        }

        let new_mode = if critical_total > 0 && critical_bad == critical_total {
            DegradationMode::Offline
        } else if critical_bad > 0 {
            DegradationMode::Minimal
        } else if non_critical_bad > 0 {
            DegradationMode::Degraded
        } else {
            DegradationMode::Normal
        };

        if new_mode != state.mode {
            tracing::warn!(from = %state.mode, to = %new_mode, "degradation mode changed");
            state.mode = new_mode;
        }
    }

    /// Enqueue to the broker, or to the disk fallback when the broker is
    /// down. Returns `true` iff either path accepted the item.
    pub async fn enqueue(&self, queue: &str, item: Value) -> bool {
        let broker_usable = {
            let state = self.inner.lock().await;
            state.broker_healthy && self.broker.is_some()
        };

        if broker_usable {
            // `broker` is Some here; re-checked to keep the lock scope tight.
            if let Some(broker) = self.broker.clone() {
                match broker.safe_enqueue(queue, item.clone(), OverflowPolicy::Dlq).await {
                    Ok(receipt) if receipt.success => {
                        if receipt.had_backpressure {
                            tracing::warn!(
                                queue,
                                queue_length = receipt.queue_length,
                                moved_to_dlq = receipt.moved_to_dlq_count,
                                "queue backpressure on enqueue"
                            );
                        }
                        return true;
                    }
                    Ok(receipt) => {
                        tracing::error!(
                            queue,
                            queue_length = receipt.queue_length,
                            error = receipt.error.as_deref().unwrap_or("enqueue rejected"),
                            "broker rejected enqueue, falling back to disk"
                        );
                        self.mark_broker_unhealthy().await;
                    }
                    Err(e) => {
                        tracing::warn!(queue, error = %e, "broker enqueue failed, falling back to disk");
                        self.mark_broker_unhealthy().await;
                    }
                }
            }
        }

        let fallback = self.fallback_queue(queue).await;
        fallback.enqueue(&item).await
    }

    /// Defer a typed operational job: broker first, memory ring second.
    pub async fn queue_job(&self, job_type: &str, payload: Value) -> bool {
        let job = QueuedJob::new(job_type, payload);

        let broker_usable = {
            let state = self.inner.lock().await;
            state.broker_healthy && self.broker.is_some()
        };

        if broker_usable {
            if let Some(broker) = self.broker.clone() {
                match serde_json::to_value(&job) {
                    Ok(encoded) => {
                        match broker
                            .safe_enqueue(DEFERRED_JOBS_QUEUE, encoded, OverflowPolicy::Dlq)
                            .await
                        {
                            Ok(receipt) if receipt.success => {
                                if receipt.had_backpressure {
                                    tracing::warn!(
                                        queue = DEFERRED_JOBS_QUEUE,
                                        queue_length = receipt.queue_length,
                                        moved_to_dlq = receipt.moved_to_dlq_count,
                                        "queue backpressure while deferring job"
                                    );
                                }
                                tracing::debug!(job_type, "job deferred to broker");
                                return true;
                            }
                            Ok(receipt) => {
                                tracing::error!(
                                    queue = DEFERRED_JOBS_QUEUE,
                                    error = receipt.error.as_deref().unwrap_or("enqueue rejected"),
                                    "failed to defer job to broker"
                                );
                            }
                            Err(e) => {
                                tracing::warn!(job_type, error = %e, "broker unavailable, deferring job to memory");
                                self.mark_broker_unhealthy().await;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(job_type, error = %e, "failed to encode deferred job");
                        return false;
                    }
                }
            }
        }

        self.queue_job_to_memory(job).await
    }

    async fn queue_job_to_memory(&self, job: QueuedJob) -> bool {
        let mut state = self.inner.lock().await;
        if state.memory_queue.len() >= self.options.memory_queue_max {
            if let Some(dropped) = state.memory_queue.pop_front() {
                tracing::warn!(
                    dropped_job_type = %dropped.job_type,
                    dropped_job_queued_at = %dropped.queued_at,
                    new_job_type = %job.job_type,
                    max_size = self.options.memory_queue_max,
                    "DATA LOSS: memory queue overflow, oldest job discarded"
                );
            }
        }
        state.memory_queue.push_back(job);
        tracing::debug!(size = state.memory_queue.len(), "job deferred to memory");
        true
    }

    pub async fn memory_queue_len(&self) -> usize {
        self.inner.lock().await.memory_queue.len()
    }

    /// Deferred jobs across the broker queue and the memory ring.
    pub async fn pending_job_count(&self) -> usize {
        let (memory, broker_usable) = {
            let state = self.inner.lock().await;
            (state.memory_queue.len(), state.broker_healthy && self.broker.is_some())
        };

        if broker_usable {
            if let Some(broker) = &self.broker {
                match broker.queue_length(DEFERRED_JOBS_QUEUE).await {
                    Ok(len) => return memory + len,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read deferred queue length");
                    }
                }
            }
        }
        memory
    }

    /// Move memory-queued jobs back to the broker, FIFO. Stops at the first
    /// broker failure, restoring the job to the head of the ring.
    pub async fn drain_memory_to_broker(&self) -> usize {
        let Some(broker) = self.broker.clone() else {
            return 0;
        };

        let mut drained = 0;
        loop {
            let Some(job) = self.inner.lock().await.memory_queue.pop_front() else {
                break;
            };

            let encoded = match serde_json::to_value(&job) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::error!(job_type = %job.job_type, error = %e, "failed to encode job, dropping");
                    continue;
                }
            };

            match broker.safe_enqueue(DEFERRED_JOBS_QUEUE, encoded, OverflowPolicy::Dlq).await {
                Ok(receipt) if receipt.success => {
                    drained += 1;
                    if receipt.had_backpressure {
                        tracing::warn!(
                            queue = DEFERRED_JOBS_QUEUE,
                            queue_length = receipt.queue_length,
                            "backpressure while draining memory queue"
                        );
                    }
                }
                Ok(receipt) => {
                    tracing::error!(
                        queue = DEFERRED_JOBS_QUEUE,
                        error = receipt.error.as_deref().unwrap_or("enqueue rejected"),
                        "drain stopped, restoring job"
                    );
                    self.inner.lock().await.memory_queue.push_front(job);
                    break;
                }
                Err(e) => {
                    tracing::error!(queue = DEFERRED_JOBS_QUEUE, error = %e, "drain stopped, restoring job");
                    self.inner.lock().await.memory_queue.push_front(job);
                    break;
                }
            }
        }

        if drained > 0 {
            tracing::info!(drained, "memory queue drained to broker");
        }
        drained
    }

    /// Get or create the disk fallback queue for `name`.
    pub async fn fallback_queue(&self, name: &str) -> Arc<FallbackQueue> {
        let mut state = self.inner.lock().await;
        if let Some(queue) = state.fallback_queues.get(name) {
            return queue.clone();
        }
        let queue = Arc::new(FallbackQueue::new(
            name,
            &self.options.fallback_dir,
            self.options.fallback_queue_max,
        ));
        state.fallback_queues.insert(name.to_string(), queue.clone());
        queue
    }

    /// Current depth of every disk fallback queue that has been touched.
    pub async fn fallback_depths(&self) -> BTreeMap<String, usize> {
        let queues: Vec<(String, Arc<FallbackQueue>)> = {
            let state = self.inner.lock().await;
            state.fallback_queues.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut depths = BTreeMap::new();
        for (name, queue) in queues {
            depths.insert(name, queue.count().await);
        }
        depths
    }

    /// Drain one disk fallback queue into the broker, FIFO. A failed
    /// hand-off puts the item back and stops the drain.
    pub async fn drain_fallback_queue(&self, name: &str) -> usize {
        let Some(broker) = self.broker.clone() else {
            tracing::warn!(queue = name, "cannot drain fallback queue: no broker configured");
            return 0;
        };

        let queue = self.fallback_queue(name).await;
        let mut drained = 0;

        loop {
            let Some(item) = queue.dequeue().await else {
                break;
            };

            match broker.safe_enqueue(name, item.clone(), OverflowPolicy::Dlq).await {
                Ok(receipt) if receipt.success => {
                    drained += 1;
                    if receipt.had_backpressure {
                        tracing::warn!(
                            queue = name,
                            queue_length = receipt.queue_length,
                            moved_to_dlq = receipt.moved_to_dlq_count,
                            "backpressure while draining fallback queue"
                        );
                    }
                }
                Ok(receipt) => {
                    tracing::error!(
                        queue = name,
                        error = receipt.error.as_deref().unwrap_or("enqueue rejected"),
                        "fallback drain stopped, restoring item"
                    );
                    queue.enqueue(&item).await;
                    break;
                }
                Err(e) => {
                    tracing::error!(queue = name, error = %e, "fallback drain stopped, restoring item");
                    queue.enqueue(&item).await;
                    break;
                }
            }
        }

        tracing::info!(queue = name, drained, "fallback queue drained");
        drained
    }

    async fn mark_broker_unhealthy(&self) {
        let mut state = self.inner.lock().await;
        if state.broker_healthy {
            tracing::warn!("broker marked unhealthy, queueing falls back to disk/memory");
        }
        state.broker_healthy = false;
        state.broker_recovery_streak = 0;
    }

    /// Ping the broker and update the healthy flag. Recovery requires
    /// `recovery_threshold` consecutive successful pings.
    pub async fn check_broker_health(&self) -> bool {
        let Some(broker) = self.broker.clone() else {
            return false;
        };

        match broker.ping().await {
            Ok(()) => {
                let mut state = self.inner.lock().await;
                if state.broker_healthy {
                    return true;
                }
                state.broker_recovery_streak += 1;
                if state.broker_recovery_streak >= self.options.recovery_threshold {
                    state.broker_healthy = true;
                    state.broker_recovery_streak = 0;
                    tracing::info!("broker connection restored");
                    return true;
                }
                tracing::debug!(
                    streak = state.broker_recovery_streak,
                    needed = self.options.recovery_threshold,
                    "broker ping ok, awaiting recovery threshold"
                );
                false
            }
            Err(e) => {
                let mut state = self.inner.lock().await;
                if state.broker_healthy {
                    tracing::warn!(error = %e, "broker health check failed");
                }
                state.broker_healthy = false;
                state.broker_recovery_streak = 0;
                false
            }
        }
    }

    /// Process deferred jobs of one type, up to `max_jobs`, via `processor`.
    /// Failed jobs are re-queued with an incremented retry count.
    pub async fn process_queued_jobs<P>(&self, job_type: &str, processor: P, max_jobs: usize) -> usize
    where
        P: Fn(Value) -> BoxFuture<'static, Result<(), ServiceError>>,
    {
        let mut processed = 0;

        let broker_usable = {
            let state = self.inner.lock().await;
            state.broker_healthy && self.broker.is_some()
        };

        if broker_usable {
            if let Some(broker) = self.broker.clone() {
                for _ in 0..max_jobs {
                    if processed >= max_jobs {
                        break;
                    }
                    let raw = match broker.nonblocking_pop(DEFERRED_JOBS_QUEUE).await {
                        Ok(Some(raw)) => raw,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(error = %e, "error reading deferred queue");
                            break;
                        }
                    };

                    let mut job = match serde_json::from_value::<QueuedJob>(raw) {
                        Ok(job) => job,
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed deferred job");
                            continue;
                        }
                    };

                    if job.job_type != job_type {
                        // Not ours; rotate it to the back of the queue.
                        if let Ok(encoded) = serde_json::to_value(&job) {
                            let _ = broker
                                .safe_enqueue(DEFERRED_JOBS_QUEUE, encoded, OverflowPolicy::Dlq)
                                .await;
                        }
                        continue;
                    }

                    match processor(job.payload.clone()).await {
                        Ok(()) => {
                            processed += 1;
                            tracing::debug!(job_type, "deferred job processed");
                        }
                        Err(e) => {
                            tracing::error!(job_type, error = %e, "deferred job failed, re-queueing");
                            job.retry_count += 1;
                            if let Ok(encoded) = serde_json::to_value(&job) {
                                match broker
                                    .safe_enqueue(DEFERRED_JOBS_QUEUE, encoded, OverflowPolicy::Dlq)
                                    .await
                                {
                                    Ok(receipt) if receipt.success => {}
                                    Ok(receipt) => tracing::error!(
                                        error = receipt.error.as_deref().unwrap_or("rejected"),
                                        "failed to re-queue deferred job"
                                    ),
                                    Err(e) => tracing::error!(error = %e, "failed to re-queue deferred job"),
                                }
                            }
                        }
                    }
                }
            }
        }

        // Memory ring: process matching jobs, keep the rest in order.
        let jobs: Vec<QueuedJob> = {
            let mut state = self.inner.lock().await;
            state.memory_queue.drain(..).collect()
        };

        for mut job in jobs {
            if job.job_type == job_type && processed < max_jobs {
                match processor(job.payload.clone()).await {
                    Ok(()) => processed += 1,
                    Err(e) => {
                        tracing::error!(job_type, error = %e, "memory job failed, keeping for retry");
                        job.retry_count += 1;
                        self.inner.lock().await.memory_queue.push_back(job);
                    }
                }
            } else {
                self.inner.lock().await.memory_queue.push_back(job);
            }
        }

        processed
    }

    /// Feature list for the current mode.
    pub async fn available_features(&self) -> Vec<String> {
        let mode = self.inner.lock().await.mode;
        Self::features_for(mode)
    }

    fn features_for(mode: DegradationMode) -> Vec<String> {
        let features: &[&str] = match mode {
            DegradationMode::Normal => &["detection", "analysis", "events", "media"],
            DegradationMode::Degraded => &["events", "media"],
            DegradationMode::Minimal => &["media"],
            DegradationMode::Offline => &[],
        };
        features.iter().map(|f| f.to_string()).collect()
    }

    /// Operator-facing status summary.
    pub async fn status(&self) -> DegradationStatus {
        let (mode, broker_healthy, memory_queue_size, services) = {
            let state = self.inner.lock().await;
            (
                state.mode,
                state.broker_healthy,
                state.memory_queue.len(),
                state
                    .services
                    .iter()
                    .map(|(name, service)| (name.clone(), service.health.clone()))
                    .collect::<BTreeMap<_, _>>(),
            )
        };

        DegradationStatus {
            mode,
            is_degraded: mode != DegradationMode::Normal,
            broker_healthy,
            memory_queue_size,
            fallback_queues: self.fallback_depths().await,
            services,
            available_features: Self::features_for(mode),
        }
    }

    /// Spawn the periodic probe loop. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
        if lifecycle.is_some() {
            tracing::warn!("degradation manager already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.options.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => manager.tick().await,
                }
            }
        });

        *lifecycle = Some(LoopHandle { shutdown, task });
        tracing::info!("degradation manager started");
    }

    /// One probe-loop iteration: probe services, check the broker, and drain
    /// queued work after a recovery.
    async fn tick(&self) {
        self.run_probes().await;

        let was_healthy = self.broker_is_healthy().await;
        let healthy = self.check_broker_health().await;

        if healthy {
            if self.memory_queue_len().await > 0 {
                self.drain_memory_to_broker().await;
            }
            if !was_healthy {
                let names: Vec<String> = {
                    let state = self.inner.lock().await;
                    state.fallback_queues.keys().cloned().collect()
                };
                for name in names {
                    self.drain_fallback_queue(&name).await;
                }
            }
        }
    }

    /// Stop the probe loop and wait for it to finish. Cancellation during an
    /// in-flight probe is normal shutdown, not an error.
    pub async fn stop(&self) {
        let handle = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
            lifecycle.take()
        };

        if let Some(LoopHandle { shutdown, task }) = handle {
            let _ = shutdown.send(true);
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "probe loop terminated abnormally");
                }
            }
            tracing::info!("degradation manager stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(dir: &std::path::Path) -> DegradationOptions {
        DegradationOptions {
            failure_threshold: 2,
            fallback_dir: dir.to_path_buf(),
            ..DegradationOptions::default()
        }
    }

    async fn manager_with_services(dir: &std::path::Path) -> DegradationManager {
        let manager = DegradationManager::new(None, options(dir));
        let healthy = probe_fn(|| async { Ok(true) });
        manager.register_service("detector", healthy.clone(), true).await;
        manager.register_service("risk_llm", healthy.clone(), true).await;
        manager.register_service("caption", healthy, false).await;
        manager
    }

    #[tokio::test]
    async fn services_start_unknown_and_mode_normal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_services(dir.path()).await;

        let health = manager.service_health("detector").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unknown);
        assert_eq!(manager.mode().await, DegradationMode::Normal);
    }

    #[tokio::test]
    async fn mode_follows_failure_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_services(dir.path()).await;

        // One caption failure: below threshold, still normal.
        manager.update_service_health("caption", false, Some("down".into())).await;
        assert_eq!(manager.mode().await, DegradationMode::Normal);

        // Second caption failure: non-critical bad -> degraded.
        manager.update_service_health("caption", false, Some("down".into())).await;
        assert_eq!(manager.mode().await, DegradationMode::Degraded);

        // Detector crosses the threshold: one critical bad -> minimal.
        manager.update_service_health("detector", false, Some("down".into())).await;
        manager.update_service_health("detector", false, Some("down".into())).await;
        assert_eq!(manager.mode().await, DegradationMode::Minimal);

        // Both critical services bad -> offline.
        manager.update_service_health("risk_llm", false, Some("down".into())).await;
        manager.update_service_health("risk_llm", false, Some("down".into())).await;
        assert_eq!(manager.mode().await, DegradationMode::Offline);
        assert!(!manager.is_accepting_jobs().await);

        // Healthy probes reset the counters and the mode walks back.
        manager.update_service_health("detector", true, None).await;
        manager.update_service_health("risk_llm", true, None).await;
        assert_eq!(manager.mode().await, DegradationMode::Degraded);
        manager.update_service_health("caption", true, None).await;
        assert_eq!(manager.mode().await, DegradationMode::Normal);
    }

    #[tokio::test]
    async fn healthy_update_clears_failure_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_services(dir.path()).await;

        manager.update_service_health("detector", false, Some("boom".into())).await;
        manager.update_service_health("detector", true, None).await;

        let health = manager.service_health("detector").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.error_message.is_none());
        assert!(health.last_success_at.is_some());
    }

    #[tokio::test]
    async fn probe_timeout_counts_as_failure_with_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.probe_timeout = Duration::from_millis(20);
        let manager = DegradationManager::new(None, opts);

        let slow = probe_fn(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        });
        manager.register_service("detector", slow, true).await;

        manager.run_probes().await;

        let health = manager.service_health("detector").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn probe_error_records_message() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DegradationManager::new(None, options(dir.path()));
        let failing = probe_fn(|| async { Err(ServiceError::ConnectRefused) });
        manager.register_service("detector", failing, true).await;

        manager.run_probes().await;

        let health = manager.service_health("detector").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.error_message.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn memory_queue_drops_oldest_on_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.memory_queue_max = 2;
        let manager = DegradationManager::new(None, opts);

        assert!(manager.queue_job("detection", json!({"id": 1})).await);
        assert!(manager.queue_job("detection", json!({"id": 2})).await);
        assert!(manager.queue_job("detection", json!({"id": 3})).await);

        assert_eq!(manager.memory_queue_len().await, 2);
        // Oldest (id 1) was discarded; the ring now holds 2 and 3.
        let state = manager.inner.lock().await;
        let ids: Vec<_> =
            state.memory_queue.iter().map(|j| j.payload["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn enqueue_without_broker_uses_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DegradationManager::new(None, options(dir.path()));

        assert!(manager.enqueue("detection_queue", json!({"x": 1})).await);

        let queue = manager.fallback_queue("detection_queue").await;
        assert_eq!(queue.count().await, 1);
        assert_eq!(queue.peek(1).await, vec![json!({"x": 1})]);
    }

    #[tokio::test]
    async fn status_reflects_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_services(dir.path()).await;
        manager.enqueue("detection_queue", json!({"x": 1})).await;

        let status = manager.status().await;
        assert_eq!(status.mode, DegradationMode::Normal);
        assert!(!status.is_degraded);
        assert_eq!(status.services.len(), 3);
        assert_eq!(status.fallback_queues.get("detection_queue"), Some(&1));
        assert_eq!(
            status.available_features,
            vec!["detection", "analysis", "events", "media"]
        );
    }

    #[tokio::test]
    async fn features_shrink_with_mode() {
        assert_eq!(
            DegradationManager::features_for(DegradationMode::Degraded),
            vec!["events", "media"]
        );
        assert_eq!(DegradationManager::features_for(DegradationMode::Minimal), vec!["media"]);
        assert!(DegradationManager::features_for(DegradationMode::Offline).is_empty());
    }

    #[tokio::test]
    async fn start_stop_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.check_interval = Duration::from_millis(10);
        let manager = Arc::new(DegradationManager::new(None, opts));

        let healthy = probe_fn(|| async { Ok(true) });
        manager.register_service("detector", healthy, true).await;

        manager.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop().await;

        let health = manager.service_health("detector").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
    }
}
