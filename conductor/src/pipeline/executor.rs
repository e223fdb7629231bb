//! The seam between the scheduler and whatever actually runs agents.

use super::catalog::StageDefinition;
use super::session::PipelineSession;
use crate::core::StageStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One call to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageInvocation {
    /// Stage name, or a generated label for ad-hoc invocations.
    pub name: String,
    /// Agent to run.
    pub agent_type: String,
    /// Free-form inputs for the agent.
    #[serde(default)]
    pub inputs: Value,
    /// Names of the artifacts the agent is expected to produce.
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl StageInvocation {
    /// An ad-hoc invocation.
    #[must_use]
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            inputs: Value::Null,
            outputs: Vec::new(),
        }
    }

    /// The invocation for a catalog stage.
    #[must_use]
    pub fn for_stage(stage: &StageDefinition) -> Self {
        let mut invocation = Self::new(&stage.name, &stage.agent_type);
        if !stage.description.is_empty() {
            invocation.inputs = serde_json::json!({ "description": stage.description });
        }
        invocation
    }

    /// Sets the inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the expected outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|o| (*o).to_string()).collect();
        self
    }
}

/// Runs agents on behalf of the scheduler.
///
/// The executor is opaque: the orchestrator only records whether a call
/// succeeded and, if not, the error's message.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs one invocation and returns its textual output.
    async fn invoke_agent(
        &self,
        invocation: &StageInvocation,
        session: &PipelineSession,
    ) -> anyhow::Result<String>;
}

/// The record of one invocation made by `coordinate_agents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecution {
    /// The invocation's name.
    pub name: String,
    /// The invocation's agent type.
    pub agent_type: String,
    /// `completed` or `failed`.
    pub status: StageStatus,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Output on success.
    #[serde(default)]
    pub output: Option<String>,
    /// Error message on failure.
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentExecution {
    /// True if the invocation succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_for_stage_carries_description() {
        let stage = StageDefinition::new("architecture", "architect").with_description("Design it");
        let invocation = StageInvocation::for_stage(&stage);

        assert_eq!(invocation.agent_type, "architect");
        assert_eq!(invocation.inputs, json!({"description": "Design it"}));
        assert!(invocation.outputs.is_empty());
    }

    #[test]
    fn test_ad_hoc_invocation_builder() {
        let invocation = StageInvocation::new("lint#0", "linter")
            .with_inputs(json!({"files": ["src/lib.rs"]}))
            .with_outputs(&["lint-report.md"]);

        let value = serde_json::to_value(&invocation).unwrap();
        assert_eq!(value["agentType"], "linter");
        assert_eq!(value["outputs"][0], "lint-report.md");
    }
}
