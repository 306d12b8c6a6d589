//! Fallback strategies for the AI model fleet.
//!
//! Tracks a [`ModelState`] per model, derives per-model availability from the
//! shared breaker registry (or an explicit probe when no breaker is
//! registered), publishes a [`DegradationLevel`], and produces deterministic
//! fallback outputs when a model is out: cached or heuristic risk scores,
//! synthesized captions, and a zero-vector embedding that will never match a
//! real one.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::breaker_registry::BreakerRegistry;
use crate::circuit_breaker::{BreakerConfig, CircuitState};
use crate::degradation::HealthProbe;
use crate::error::{ErrorKind, ServiceError};

/// Consecutive probe failures before a probed model counts as unavailable.
const PROBE_FAILURE_THRESHOLD: u32 = 3;

/// Embedding width of the vision/text embedding model.
const EMBEDDING_DIM: usize = 768;

/// The AI models this backend depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AiService {
    /// Object detection. Critical.
    Detector,
    /// LLM risk analysis. Critical.
    RiskLlm,
    /// Vision-language captioning.
    Caption,
    /// Embedding service.
    Embedding,
}

impl AiService {
    pub const ALL: [AiService; 4] =
        [AiService::Detector, AiService::RiskLlm, AiService::Caption, AiService::Embedding];

    pub fn is_critical(self) -> bool {
        matches!(self, AiService::Detector | AiService::RiskLlm)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AiService::Detector => "detector",
            AiService::RiskLlm => "risk_llm",
            AiService::Caption => "caption",
            AiService::Embedding => "embedding",
        }
    }
}

impl std::fmt::Display for AiService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// No breaker observation or probe result yet.
    Unknown,
    Healthy,
    Degraded,
    Unavailable,
}

/// Coarse summary of AI capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    Normal,
    Degraded,
    Minimal,
    Offline,
}

/// Tracked state for one model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelState {
    pub service: AiService,
    pub status: ModelStatus,
    pub circuit_state: CircuitState,
    pub last_success_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub error_message: Option<String>,
    pub last_check_at: Option<DateTime<Utc>>,
}

impl ModelState {
    fn new(service: AiService) -> Self {
        Self {
            service,
            status: ModelStatus::Unknown,
            circuit_state: CircuitState::Closed,
            last_success_at: None,
            failure_count: 0,
            error_message: None,
            last_check_at: None,
        }
    }
}

/// Where a fallback risk score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSource {
    Cache,
    ObjectTypeEstimate,
    Default,
}

/// Deterministic risk analysis returned while the risk LLM is out.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackRiskAnalysis {
    pub risk_score: u8,
    pub reasoning: String,
    pub is_fallback: bool,
    pub source: RiskSource,
}

/// Complete status map handed to broadcast callbacks.
#[derive(Debug, Clone, Serialize)]
pub struct AiStatus {
    pub timestamp: DateTime<Utc>,
    pub degradation_level: DegradationLevel,
    pub services: BTreeMap<String, ModelState>,
    pub available_features: Vec<String>,
}

/// Async status-change callback; failures are logged and isolated.
pub type StatusCallback =
    Arc<dyn Fn(AiStatus) -> BoxFuture<'static, Result<(), ServiceError>> + Send + Sync>;

/// Wrap a plain async closure as a [`StatusCallback`].
pub fn callback_fn<F, Fut>(f: F) -> StatusCallback
where
    F: Fn(AiStatus) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    Arc::new(move |status| Box::pin(f(status)))
}

/// Default per-model risk score used when the risk LLM is unavailable.
pub fn object_type_score(object_type: &str) -> u8 {
    match object_type.to_ascii_lowercase().as_str() {
        "person" => 60,
        "vehicle" => 50,
        "car" => 50,
        "truck" => 55,
        "motorcycle" => 45,
        "bicycle" => 30,
        "dog" => 25,
        "cat" => 20,
        "bird" => 10,
        _ => 50,
    }
}

/// Breaker defaults tuned per model: the detector trips fast, the slower
/// LLM gets a longer recovery window.
pub fn default_breaker_config(service: AiService) -> BreakerConfig {
    let (failure_threshold, success_threshold, recovery_timeout, half_open_max_calls) =
        match service {
            AiService::Detector => (3, 2, Duration::from_secs(60), 2),
            AiService::RiskLlm => (5, 2, Duration::from_secs(90), 3),
            AiService::Caption => (5, 2, Duration::from_secs(60), 3),
            AiService::Embedding => (5, 2, Duration::from_secs(60), 3),
        };
    BreakerConfig {
        failure_threshold,
        success_threshold,
        recovery_timeout,
        half_open_max_calls,
        excluded_kinds: vec![ErrorKind::Client],
    }
}

struct RiskScoreCache {
    ttl: Duration,
    camera_scores: HashMap<String, (u8, Instant)>,
}

impl RiskScoreCache {
    fn new(ttl: Duration) -> Self {
        Self { ttl, camera_scores: HashMap::new() }
    }

    fn get(&self, camera_name: &str) -> Option<u8> {
        let (score, stamped) = self.camera_scores.get(camera_name)?;
        if stamped.elapsed() > self.ttl {
            return None;
        }
        Some(*score)
    }

    fn set(&mut self, camera_name: &str, score: u8) {
        self.camera_scores.insert(camera_name.to_string(), (score, Instant::now()));
    }
}

struct AiState {
    states: BTreeMap<AiService, ModelState>,
    breaker_names: BTreeMap<AiService, String>,
    probes: BTreeMap<AiService, HealthProbe>,
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Tracks model availability and serves fallback outputs.
pub struct AiFallbackService {
    registry: Arc<BreakerRegistry>,
    health_check_interval: Duration,
    inner: Mutex<AiState>,
    risk_cache: Mutex<RiskScoreCache>,
    callbacks: Mutex<Vec<StatusCallback>>,
    lifecycle: Mutex<Option<LoopHandle>>,
}

impl AiFallbackService {
    pub fn new(
        registry: Arc<BreakerRegistry>,
        health_check_interval: Duration,
        risk_cache_ttl: Duration,
    ) -> Self {
        let states =
            AiService::ALL.iter().map(|&s| (s, ModelState::new(s))).collect::<BTreeMap<_, _>>();

        tracing::info!(
            health_check_interval_s = health_check_interval.as_secs_f64(),
            risk_cache_ttl_s = risk_cache_ttl.as_secs_f64(),
            "AI fallback service initialized"
        );

        Self {
            registry,
            health_check_interval,
            inner: Mutex::new(AiState {
                states,
                breaker_names: BTreeMap::new(),
                probes: BTreeMap::new(),
            }),
            risk_cache: Mutex::new(RiskScoreCache::new(risk_cache_ttl)),
            callbacks: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(None),
        }
    }

    /// Derive a model's availability from the named breaker in the shared
    /// registry instead of probing it.
    pub fn register_breaker(&self, service: AiService, breaker_name: &str) {
        let mut state = self.lock_inner();
        state.breaker_names.insert(service, breaker_name.to_string());
        tracing::debug!(service = %service, breaker = breaker_name, "breaker registered for model");
    }

    /// Probe a model directly; used when no breaker guards its call site.
    pub fn register_probe(&self, service: AiService, probe: HealthProbe) {
        let mut state = self.lock_inner();
        state.probes.insert(service, probe);
    }

    /// Register a callback invoked with the full status map on any change.
    pub fn register_status_callback(&self, callback: StatusCallback) {
        self.lock_callbacks().push(callback);
    }

    pub fn unregister_status_callback(&self, callback: &StatusCallback) {
        self.lock_callbacks().retain(|cb| !Arc::ptr_eq(cb, callback));
    }

    pub fn model_state(&self, service: AiService) -> ModelState {
        self.lock_inner().states[&service].clone()
    }

    /// Whether the model can be called (healthy, degraded, or not yet seen).
    pub fn is_available(&self, service: AiService) -> bool {
        self.lock_inner().states[&service].status != ModelStatus::Unavailable
    }

    pub fn should_skip_detection(&self) -> bool {
        !self.is_available(AiService::Detector)
    }

    pub fn should_use_default_risk(&self) -> bool {
        !self.is_available(AiService::RiskLlm)
    }

    pub fn should_skip_captions(&self) -> bool {
        !self.is_available(AiService::Caption)
    }

    pub fn should_skip_reid(&self) -> bool {
        !self.is_available(AiService::Embedding)
    }

    /// Degradation level per model availability: all critical out is
    /// offline, any critical out is minimal, only non-critical out is
    /// degraded.
    pub fn degradation_level(&self) -> DegradationLevel {
        let state = self.lock_inner();
        Self::level_of(&state.states)
    }

    fn level_of(states: &BTreeMap<AiService, ModelState>) -> DegradationLevel {
        let critical_total =
            AiService::ALL.iter().filter(|s| s.is_critical()).count() as u32;
        let mut critical_out = 0u32;
        let mut non_critical_out = 0u32;

        for (service, model) in states {
            if model.status == ModelStatus::Unavailable {
                if service.is_critical() {
                    critical_out += 1;
                } else {
                    non_critical_out += 1;
                }
            }
        }

        if critical_out == critical_total && critical_total > 0 {
            DegradationLevel::Offline
        } else if critical_out > 0 {
            DegradationLevel::Minimal
        } else if non_critical_out > 0 {
            DegradationLevel::Degraded
        } else {
            DegradationLevel::Normal
        }
    }

    /// Features currently usable given model availability.
    pub fn available_features(&self) -> Vec<String> {
        let state = self.lock_inner();
        Self::features_of(&state.states)
    }

    fn features_of(states: &BTreeMap<AiService, ModelState>) -> Vec<String> {
        let available = |s: AiService| states[&s].status != ModelStatus::Unavailable;
        let mut features: Vec<&str> = Vec::new();

        if available(AiService::Detector) {
            features.extend(["object_detection", "detection_alerts"]);
        }
        if available(AiService::RiskLlm) {
            features.extend(["risk_analysis", "llm_reasoning"]);
        }
        if available(AiService::Caption) {
            features.extend(["image_captioning", "ocr", "dense_captioning"]);
        }
        if available(AiService::Embedding) {
            features.extend(["entity_tracking", "re_identification", "anomaly_detection"]);
        }
        features.extend(["event_history", "camera_feeds", "system_monitoring"]);

        features.into_iter().map(String::from).collect()
    }

    /// Full status map: level, per-model state, and feature list.
    pub fn status(&self) -> AiStatus {
        let state = self.lock_inner();
        AiStatus {
            timestamp: Utc::now(),
            degradation_level: Self::level_of(&state.states),
            services: state
                .states
                .iter()
                .map(|(service, model)| (service.as_str().to_string(), model.clone()))
                .collect(),
            available_features: Self::features_of(&state.states),
        }
    }

    /// Refresh every model's state; broadcast when any status changed.
    pub async fn refresh_all(&self) {
        let mut changed = false;
        for service in AiService::ALL {
            let old = self.lock_inner().states[&service].status;
            self.refresh_service(service).await;
            let new = self.lock_inner().states[&service].status;
            if old != new {
                changed = true;
                tracing::info!(service = %service, from = ?old, to = ?new, "model status changed");
            }
        }

        if changed {
            self.broadcast().await;
        }
    }

    async fn refresh_service(&self, service: AiService) {
        let (breaker_name, probe) = {
            let state = self.lock_inner();
            (state.breaker_names.get(&service).cloned(), state.probes.get(&service).cloned())
        };

        // Breaker state wins when one is registered: the call site already
        // observes every real request.
        if let Some(name) = breaker_name {
            if let Some(breaker) = self.registry.get(&name) {
                let metrics = breaker.snapshot();
                let mut state = self.lock_inner();
                if let Some(model) = state.states.get_mut(&service) {
                    model.last_check_at = Some(Utc::now());
                    model.circuit_state = metrics.state;
                    model.failure_count = metrics.failure_count;
                    model.status = match metrics.state {
                        CircuitState::Open => ModelStatus::Unavailable,
                        CircuitState::HalfOpen => ModelStatus::Degraded,
                        CircuitState::Closed => ModelStatus::Healthy,
                    };
                }
                return;
            }
            tracing::warn!(service = %service, breaker = %name, "registered breaker not found");
        }

        let Some(probe) = probe else {
            // Nothing to observe; the model stays in its last known status.
            let mut state = self.lock_inner();
            if let Some(model) = state.states.get_mut(&service) {
                model.last_check_at = Some(Utc::now());
            }
            return;
        };

        let outcome = probe().await;
        let mut state = self.lock_inner();
        let Some(model) = state.states.get_mut(&service) else {
            return;
        };
        model.last_check_at = Some(Utc::now());
        match outcome {
            Ok(true) => {
                model.status = ModelStatus::Healthy;
                model.last_success_at = Some(Utc::now());
                model.failure_count = 0;
                model.error_message = None;
            }
            Ok(false) => {
                model.failure_count += 1;
                model.status = if model.failure_count >= PROBE_FAILURE_THRESHOLD {
                    ModelStatus::Unavailable
                } else {
                    ModelStatus::Degraded
                };
            }
            Err(e) => {
                model.failure_count += 1;
                model.error_message = Some(e.to_string());
                model.status = ModelStatus::Unavailable;
            }
        }
    }

    async fn broadcast(&self) {
        let status = self.status();
        let callbacks: Vec<StatusCallback> = self.lock_callbacks().clone();

        for callback in callbacks {
            if let Err(e) = callback(status.clone()).await {
                tracing::error!(error = %e, "status callback failed");
            }
        }
    }

    // =====================================================================
    // Fallback outputs
    // =====================================================================

    /// Risk analysis substitute while the risk LLM is out: cached score for
    /// the camera, else the mean of per-object-type defaults, else 50.
    pub fn fallback_risk_analysis(
        &self,
        camera_name: Option<&str>,
        object_types: &[String],
    ) -> FallbackRiskAnalysis {
        if let Some(camera) = camera_name {
            if let Some(score) = self.lock_cache().get(camera) {
                return FallbackRiskAnalysis {
                    risk_score: score,
                    reasoning: format!(
                        "Using cached risk score from camera '{camera}'. \
                         Risk analyzer is currently unavailable."
                    ),
                    is_fallback: true,
                    source: RiskSource::Cache,
                };
            }
        }

        if !object_types.is_empty() {
            let sum: u32 = object_types.iter().map(|t| object_type_score(t) as u32).sum();
            let mean = (sum / object_types.len() as u32) as u8;
            return FallbackRiskAnalysis {
                risk_score: mean,
                reasoning: format!(
                    "Estimated risk score based on detected objects: {}. \
                     Risk analyzer is currently unavailable.",
                    object_types.join(", ")
                ),
                is_fallback: true,
                source: RiskSource::ObjectTypeEstimate,
            };
        }

        FallbackRiskAnalysis {
            risk_score: 50,
            reasoning: "Using default medium risk score. Risk analyzer is \
                        currently unavailable for detailed analysis."
                .to_string(),
            is_fallback: true,
            source: RiskSource::Default,
        }
    }

    /// Remember a real risk score so later fallbacks can reuse it.
    pub fn cache_risk_score(&self, camera_name: &str, risk_score: u8) {
        self.lock_cache().set(camera_name, risk_score);
    }

    /// Caption substitute while the captioning model is out.
    pub fn fallback_caption(&self, object_types: &[String], camera_name: Option<&str>) -> String {
        if object_types.is_empty() {
            return match camera_name {
                Some(camera) => format!("Activity detected at {camera}"),
                None => "Activity detected".to_string(),
            };
        }

        let mut objects = object_types.join(", ").to_lowercase();
        if let Some(first) = objects.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        match camera_name {
            Some(camera) => format!("{objects} detected at {camera}"),
            None => format!("{objects} detected"),
        }
    }

    /// Zero vector returned while the embedding model is out; guaranteed not
    /// to match any stored embedding.
    pub fn fallback_embedding(&self) -> Vec<f32> {
        vec![0.0; EMBEDDING_DIM]
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    /// Spawn the periodic refresh loop. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
        if lifecycle.is_some() {
            tracing::warn!("AI fallback service already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let service = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => service.refresh_all().await,
                }
            }
        });

        *lifecycle = Some(LoopHandle { shutdown, task });
        tracing::info!("AI fallback service started");
    }

    /// Stop the refresh loop and wait for it.
    pub async fn stop(&self) {
        let handle = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
            lifecycle.take()
        };

        if let Some(LoopHandle { shutdown, task }) = handle {
            let _ = shutdown.send(true);
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "refresh loop terminated abnormally");
                }
            }
            tracing::info!("AI fallback service stopped");
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, AiState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cache(&self) -> MutexGuard<'_, RiskScoreCache> {
        self.risk_cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Vec<StatusCallback>> {
        self.callbacks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
