//! Operator-facing health view over the AI model fleet and the work queues.
//!
//! Composes per-model probe results, circuit-breaker counters, and queue
//! depths into one serializable status structure. The surrounding HTTP layer
//! renders [`HealthView`] directly and maps a critical overall status to 503.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker_registry::BreakerRegistry;
use crate::broker::{dlq_name, Broker, ANALYSIS_QUEUE, DETECTION_QUEUE};
use crate::circuit_breaker::{BreakerMetrics, CircuitState};
use crate::error::ServiceError;

/// Bound on each model probe.
pub const MODEL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Probed status of one model endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Overall status across the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Critical,
}

/// One model endpoint to probe.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub name: String,
    pub url: Option<String>,
    pub breaker_name: String,
    pub critical: bool,
}

impl ModelEndpoint {
    pub fn new(
        name: impl Into<String>,
        url: Option<String>,
        breaker_name: impl Into<String>,
        critical: bool,
    ) -> Self {
        Self { name: name.into(), url, breaker_name: breaker_name.into(), critical }
    }
}

/// Health probe against a model's `/health` endpoint. Returns the observed
/// latency in milliseconds.
#[async_trait]
pub trait ModelProber: Send + Sync {
    async fn probe(&self, url: &str) -> Result<f64, ServiceError>;
}

/// Per-model detail in the status view.
#[derive(Debug, Clone, Serialize)]
pub struct ModelHealthDetail {
    pub status: ProbeStatus,
    pub circuit_state: CircuitState,
    pub last_health_check: DateTime<Utc>,
    pub error_rate_1h: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub url: Option<String>,
    pub error: Option<String>,
}

/// Depth of one queue and its DLQ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepthInfo {
    pub depth: usize,
    pub dlq_depth: usize,
}

/// Depths of the two work queues.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueDepths {
    pub detection_queue: QueueDepthInfo,
    pub analysis_queue: QueueDepthInfo,
}

/// The complete status view.
#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub overall_status: OverallStatus,
    pub services: BTreeMap<String, ModelHealthDetail>,
    pub queues: QueueDepths,
    pub timestamp: DateTime<Utc>,
}

impl HealthView {
    /// Whether the surrounding HTTP layer should render 503.
    pub fn is_critical(&self) -> bool {
        self.overall_status == OverallStatus::Critical
    }
}

/// Rolling error-rate estimate from breaker counters, capped at 1.
fn error_rate(metrics: &BreakerMetrics) -> Option<f64> {
    if metrics.total_calls == 0 {
        return None;
    }
    let errors = metrics.failure_count as f64 + metrics.rejected_calls as f64;
    let rate = (errors / metrics.total_calls as f64).min(1.0);
    Some((rate * 10_000.0).round() / 10_000.0)
}

/// Assembles the status view from probes, breakers, and queue depths.
pub struct HealthAggregator {
    endpoints: Vec<ModelEndpoint>,
    registry: Arc<BreakerRegistry>,
    prober: Arc<dyn ModelProber>,
    broker: Option<Arc<dyn Broker>>,
    probe_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(
        endpoints: Vec<ModelEndpoint>,
        registry: Arc<BreakerRegistry>,
        prober: Arc<dyn ModelProber>,
        broker: Option<Arc<dyn Broker>>,
    ) -> Self {
        Self { endpoints, registry, prober, broker, probe_timeout: MODEL_PROBE_TIMEOUT }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Probe every endpoint concurrently and assemble the status view.
    pub async fn check(&self) -> HealthView {
        let details =
            futures::future::join_all(self.endpoints.iter().map(|e| self.check_model(e))).await;

        let services: BTreeMap<String, ModelHealthDetail> = self
            .endpoints
            .iter()
            .zip(details)
            .map(|(endpoint, detail)| (endpoint.name.clone(), detail))
            .collect();

        let overall_status = self.overall_of(&services);

        HealthView {
            overall_status,
            services,
            queues: self.queue_depths().await,
            timestamp: Utc::now(),
        }
    }

    async fn check_model(&self, endpoint: &ModelEndpoint) -> ModelHealthDetail {
        let metrics = self
            .registry
            .get(&endpoint.breaker_name)
            .map(|b| b.snapshot())
            .unwrap_or_else(|| BreakerMetrics {
                name: endpoint.breaker_name.clone(),
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                total_calls: 0,
                rejected_calls: 0,
                last_failure_at: None,
                last_transition_at: None,
            });
        let error_rate_1h = error_rate(&metrics);

        let Some(url) = endpoint.url.clone() else {
            return ModelHealthDetail {
                status: ProbeStatus::Unknown,
                circuit_state: metrics.state,
                last_health_check: Utc::now(),
                error_rate_1h,
                latency_p99_ms: None,
                url: None,
                error: Some("service URL not configured".into()),
            };
        };

        // An open circuit already tells us the service is unreachable; do
        // not spend a probe on it.
        if metrics.state == CircuitState::Open {
            return ModelHealthDetail {
                status: ProbeStatus::Unhealthy,
                circuit_state: metrics.state,
                last_health_check: Utc::now(),
                error_rate_1h,
                latency_p99_ms: None,
                url: Some(url),
                error: Some("circuit breaker open - service unreachable".into()),
            };
        }

        match tokio::time::timeout(self.probe_timeout, self.prober.probe(&url)).await {
            Ok(Ok(latency_ms)) => {
                let status = if metrics.state == CircuitState::HalfOpen {
                    ProbeStatus::Degraded
                } else {
                    ProbeStatus::Healthy
                };
                ModelHealthDetail {
                    status,
                    circuit_state: metrics.state,
                    last_health_check: Utc::now(),
                    error_rate_1h,
                    latency_p99_ms: Some((latency_ms * 100.0).round() / 100.0),
                    url: Some(url),
                    error: None,
                }
            }
            Ok(Err(e)) => ModelHealthDetail {
                status: ProbeStatus::Unhealthy,
                circuit_state: metrics.state,
                last_health_check: Utc::now(),
                error_rate_1h,
                latency_p99_ms: None,
                url: Some(url),
                error: Some(e.to_string()),
            },
            Err(_) => ModelHealthDetail {
                status: ProbeStatus::Unhealthy,
                circuit_state: metrics.state,
                last_health_check: Utc::now(),
                error_rate_1h,
                latency_p99_ms: None,
                url: Some(url),
                error: Some(format!("timeout after {:?}", self.probe_timeout)),
            },
        }
    }

    fn overall_of(&self, services: &BTreeMap<String, ModelHealthDetail>) -> OverallStatus {
        for endpoint in &self.endpoints {
            if !endpoint.critical {
                continue;
            }
            if let Some(detail) = services.get(&endpoint.name) {
                if matches!(detail.status, ProbeStatus::Unhealthy | ProbeStatus::Unknown) {
                    return OverallStatus::Critical;
                }
            }
        }

        for endpoint in &self.endpoints {
            if endpoint.critical {
                continue;
            }
            if let Some(detail) = services.get(&endpoint.name) {
                if matches!(detail.status, ProbeStatus::Unhealthy | ProbeStatus::Degraded) {
                    return OverallStatus::Degraded;
                }
            }
        }

        OverallStatus::Healthy
    }

    async fn queue_depths(&self) -> QueueDepths {
        let Some(broker) = &self.broker else {
            return QueueDepths::default();
        };

        let detection_dlq_name = dlq_name(DETECTION_QUEUE);
        let analysis_dlq_name = dlq_name(ANALYSIS_QUEUE);
        let (detection, analysis, detection_dlq, analysis_dlq) = tokio::join!(
            broker.queue_length(DETECTION_QUEUE),
            broker.queue_length(ANALYSIS_QUEUE),
            broker.queue_length(&detection_dlq_name),
            broker.queue_length(&analysis_dlq_name),
        );

        let or_zero = |result: Result<usize, ServiceError>, queue: &str| match result {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!(queue, error = %e, "failed to read queue depth");
                0
            }
        };

        QueueDepths {
            detection_queue: QueueDepthInfo {
                depth: or_zero(detection, DETECTION_QUEUE),
                dlq_depth: or_zero(detection_dlq, "dlq:detection_queue"),
            },
            analysis_queue: QueueDepthInfo {
                depth: or_zero(analysis, ANALYSIS_QUEUE),
                dlq_depth: or_zero(analysis_dlq, "dlq:analysis_queue"),
            },
        }
    }
}
