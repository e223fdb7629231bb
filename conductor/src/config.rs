//! Orchestrator configuration.

use crate::graph::ScoreWeights;
use crate::pipeline::{ApprovalMode, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_stage_timeout_ms() -> Option<u64> {
    Some(600_000)
}

fn default_manual_approval_timeout_ms() -> u64 {
    3_600_000
}

fn default_state_dir_name() -> String {
    ".conductor".to_string()
}

fn default_durable_checkpoints() -> bool {
    true
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retry policy for failing stages.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Default per-attempt stage timeout. `None` waits forever.
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: Option<u64>,
    /// How gated stages are approved.
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// How long a manual approval may stay unanswered.
    #[serde(default = "default_manual_approval_timeout_ms")]
    pub manual_approval_timeout_ms: u64,
    /// Per-project directory holding orchestrator state.
    #[serde(default = "default_state_dir_name")]
    pub state_dir_name: String,
    /// Write every checkpoint straight to disk instead of batching.
    #[serde(default = "default_durable_checkpoints")]
    pub durable_checkpoints: bool,
    /// Weights used when ordering dynamic work items.
    #[serde(default)]
    pub score_weights: ScoreWeights,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            stage_timeout_ms: default_stage_timeout_ms(),
            approval_mode: ApprovalMode::default(),
            manual_approval_timeout_ms: default_manual_approval_timeout_ms(),
            state_dir_name: default_state_dir_name(),
            durable_checkpoints: default_durable_checkpoints(),
            score_weights: ScoreWeights::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of retries after a failed attempt.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default stage timeout.
    #[must_use]
    pub fn with_stage_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.stage_timeout_ms = timeout;
        self
    }

    /// Sets the approval mode.
    #[must_use]
    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    /// Sets the state directory name.
    #[must_use]
    pub fn with_state_dir_name(mut self, name: impl Into<String>) -> Self {
        self.state_dir_name = name.into();
        self
    }

    /// Enables or disables durable checkpoints.
    #[must_use]
    pub fn with_durable_checkpoints(mut self, durable: bool) -> Self {
        self.durable_checkpoints = durable;
        self
    }

    /// Sets the work-item score weights.
    #[must_use]
    pub fn with_score_weights(mut self, weights: ScoreWeights) -> Self {
        self.score_weights = weights;
        self
    }

    /// The manual approval timeout as a `Duration`.
    #[must_use]
    pub fn manual_approval_timeout(&self) -> Duration {
        Duration::from_millis(self.manual_approval_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.state_dir_name, ".conductor");
        assert!(config.durable_checkpoints);
        assert_eq!(config.approval_mode, ApprovalMode::Auto);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"approval_mode": "manual", "retry": {"max_retries": 1}}"#).unwrap();

        assert_eq!(config.approval_mode, ApprovalMode::Manual);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.stage_timeout_ms, Some(600_000));
        assert_eq!(config.manual_approval_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn test_builders() {
        let config = OrchestratorConfig::new()
            .with_max_retries(0)
            .with_stage_timeout_ms(None)
            .with_durable_checkpoints(false)
            .with_state_dir_name(".state");

        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.stage_timeout_ms, None);
        assert!(!config.durable_checkpoints);
        assert_eq!(config.state_dir_name, ".state");
    }
}
