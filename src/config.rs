//! Recognized configuration options.
//!
//! The core never reads environment variables; the surrounding application
//! deserializes a [`CoreConfig`] (from file, env, or flags) and hands the
//! converted runtime structs to each component. Every section falls back to
//! its defaults when absent, so a partial config is always valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::circuit_breaker::BreakerConfig;
use crate::degradation::DegradationOptions;
use crate::error::ErrorKind;
use crate::retry::RetryConfig;

/// Top-level configuration for the resilience core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub dlq_breaker: BreakerSettings,
    pub degradation: DegradationSettings,
    pub fallback_queue: FallbackQueueSettings,
    pub ai: AiSettings,
}

/// `breaker.*` / `dlq_breaker.*` options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_s: f64,
    pub half_open_max_calls: u32,
    pub excluded_exceptions: Vec<ErrorKind>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout_s: 30.0,
            half_open_max_calls: 3,
            excluded_exceptions: vec![ErrorKind::Client],
        }
    }
}

impl BreakerSettings {
    pub fn to_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: Duration::from_secs_f64(self.recovery_timeout_s.max(0.0)),
            half_open_max_calls: self.half_open_max_calls,
            excluded_kinds: self.excluded_exceptions.clone(),
        }
    }
}

/// `retry.*` options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_s: f64,
    pub max_delay_s: f64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_s: 1.0,
            max_delay_s: 30.0,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs_f64(self.base_delay_s.max(0.0)),
            max_delay: Duration::from_secs_f64(self.max_delay_s.max(0.0)),
            exponential_base: self.exponential_base,
            jitter: self.jitter,
        }
    }
}

/// `degradation.*` options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DegradationSettings {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub check_interval_s: f64,
    pub probe_timeout_s: f64,
    pub memory_queue_max: usize,
    pub fallback_dir: PathBuf,
}

impl Default for DegradationSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
            check_interval_s: 15.0,
            probe_timeout_s: 10.0,
            memory_queue_max: 1000,
            fallback_dir: PathBuf::from("fallback_queues"),
        }
    }
}

impl DegradationSettings {
    pub fn to_options(&self, fallback_queue: &FallbackQueueSettings) -> DegradationOptions {
        DegradationOptions {
            failure_threshold: self.failure_threshold,
            recovery_threshold: self.recovery_threshold,
            check_interval: Duration::from_secs_f64(self.check_interval_s.max(0.0)),
            probe_timeout: Duration::from_secs_f64(self.probe_timeout_s.max(0.0)),
            memory_queue_max: self.memory_queue_max,
            fallback_dir: self.fallback_dir.clone(),
            fallback_queue_max: fallback_queue.max_size,
        }
    }
}

/// `fallback_queue.*` options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackQueueSettings {
    pub max_size: usize,
}

impl Default for FallbackQueueSettings {
    fn default() -> Self {
        Self { max_size: 10_000 }
    }
}

/// `ai.*` options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub risk_cache_ttl_s: f64,
    pub health_check_interval_s: f64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self { risk_cache_ttl_s: 300.0, health_check_interval_s: 15.0 }
    }
}

impl AiSettings {
    pub fn risk_cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.risk_cache_ttl_s.max(0.0))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_interval_s.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.success_threshold, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.retry.jitter);
        assert_eq!(config.degradation.failure_threshold, 3);
        assert_eq!(config.degradation.recovery_threshold, 2);
        assert_eq!(config.degradation.memory_queue_max, 1000);
        assert_eq!(config.fallback_queue.max_size, 10_000);
        assert_eq!(config.ai.risk_cache_ttl_s, 300.0);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config: CoreConfig = serde_json::from_str(
            r#"{
                "breaker": {"failure_threshold": 2, "excluded_exceptions": ["client", "decode"]},
                "retry": {"jitter": false},
                "degradation": {"check_interval_s": 5.0}
            }"#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(
            config.breaker.excluded_exceptions,
            vec![ErrorKind::Client, ErrorKind::Decode]
        );
        assert_eq!(config.breaker.success_threshold, 3);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.degradation.check_interval_s, 5.0);
        assert_eq!(config.dlq_breaker.failure_threshold, 5);
    }

    #[test]
    fn conversions_produce_durations() {
        let config = CoreConfig::default();

        let breaker = config.breaker.to_config();
        assert_eq!(breaker.recovery_timeout, Duration::from_secs(30));
        assert_eq!(breaker.excluded_kinds, vec![ErrorKind::Client]);

        let retry = config.retry.to_config();
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(30));

        let options = config.degradation.to_options(&config.fallback_queue);
        assert_eq!(options.check_interval, Duration::from_secs(15));
        assert_eq!(options.probe_timeout, Duration::from_secs(10));
        assert_eq!(options.fallback_queue_max, 10_000);

        assert_eq!(config.ai.risk_cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.ai.health_check_interval(), Duration::from_secs(15));
    }
}
