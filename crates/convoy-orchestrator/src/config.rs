use convoy_core::{ConvoyError, ConvoyResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the scheduler picks among eligible agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Minimum current load; ties go to the earliest registered agent.
    #[default]
    LoadBalanced,
    /// Rotate through eligible agents regardless of load.
    RoundRobin,
    /// Uniform sample; reproducible when `random_seed` is set.
    Random,
}

/// Thresholds applied to completed results. Failing them only logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityThresholds {
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    #[serde(default = "default_completion_time")]
    pub completion_time_secs: u64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            completion_time_secs: default_completion_time(),
        }
    }
}

/// Orchestrator configuration, typically the `[orchestrator]` table of the
/// CLI's TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_supervisor_id")]
    pub supervisor_id: String,
    #[serde(default)]
    pub assignment_strategy: AssignmentStrategy,
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default)]
    pub quality: QualityThresholds,
    #[serde(default = "default_task_timeout")]
    pub default_task_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Backoff before retry N is `2^N * backoff_unit_ms`.
    #[serde(default = "default_backoff_unit")]
    pub backoff_unit_ms: u64,
    /// Send timed-out tasks through the retry path.
    #[serde(default)]
    pub retry_timeouts: bool,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_grace")]
    pub health_grace_secs: u64,
    #[serde(default = "default_max_dispatch")]
    pub max_concurrent_dispatch: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_supervisor_id() -> String {
    "supervisor".to_string()
}
fn default_confidence_floor() -> f64 {
    0.8
}
fn default_completion_time() -> u64 {
    300
}
fn default_task_timeout() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_unit() -> u64 {
    1000
}
fn default_health_interval() -> u64 {
    30
}
fn default_health_grace() -> u64 {
    10
}
fn default_max_dispatch() -> usize {
    64
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_cleanup_interval() -> u64 {
    5
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            supervisor_id: default_supervisor_id(),
            assignment_strategy: AssignmentStrategy::default(),
            random_seed: None,
            quality: QualityThresholds::default(),
            default_task_timeout_secs: default_task_timeout(),
            default_max_retries: default_max_retries(),
            backoff_unit_ms: default_backoff_unit(),
            retry_timeouts: false,
            health_check_interval_secs: default_health_interval(),
            health_grace_secs: default_health_grace(),
            max_concurrent_dispatch: default_max_dispatch(),
            poll_interval_ms: default_poll_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> ConvoyResult<()> {
        if self.supervisor_id.trim().is_empty() {
            return Err(ConvoyError::Config("supervisor_id must not be empty".into()));
        }
        if self.max_concurrent_dispatch == 0 {
            return Err(ConvoyError::Config(
                "max_concurrent_dispatch must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("default_task_timeout_secs", self.default_task_timeout_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("poll_interval_ms", self.poll_interval_ms),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
        ] {
            if value == 0 {
                return Err(ConvoyError::Config(format!("{name} must be greater than 0")));
            }
        }
        if !(0.0..=1.0).contains(&self.quality.confidence_floor) {
            return Err(ConvoyError::Config(
                "quality.confidence_floor must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Delay before the `retry_count`-th retry.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count);
        Duration::from_millis(self.backoff_unit_ms.saturating_mul(factor))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_secs(self.health_grace_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.assignment_strategy, AssignmentStrategy::LoadBalanced);
        assert!(!config.retry_timeouts);
    }

    #[test]
    fn test_backoff_is_exponential() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(2), Duration::from_secs(4));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"assignment_strategy":"round_robin","quality":{"confidence_floor":0.5}}"#,
        )
        .unwrap();
        assert_eq!(config.assignment_strategy, AssignmentStrategy::RoundRobin);
        assert_eq!(config.quality.confidence_floor, 0.5);
        assert_eq!(config.quality.completion_time_secs, 300);
        assert_eq!(config.health_check_interval_secs, 30);
    }

    #[test]
    fn test_zero_dispatch_cap_rejected() {
        let config = OrchestratorConfig {
            max_concurrent_dispatch: 0,
            ..OrchestratorConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), "config");
    }
}
