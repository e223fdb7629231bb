//! Status and mode enums shared by the scheduler, sessions and graph analyzer.

use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The execution status of a single stage.
///
/// Transitions: `pending -> running -> {completed | retrying -> running | failed}`,
/// and `pending -> skipped`. `completed`, `failed` and `skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not started.
    #[default]
    Pending,
    /// Stage is executing.
    Running,
    /// A failed attempt is waiting to be retried.
    Retrying,
    /// Stage completed successfully.
    Completed,
    /// Stage failed after exhausting its retries.
    Failed,
    /// Stage was not executed because a dependency failed, was skipped or approval was denied.
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if dependents of a stage in this state must be skipped.
    #[must_use]
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }

    /// Returns true if `next` is a legal successor of this state.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Retrying)
                | (Self::Running, Self::Failed)
                | (Self::Retrying, Self::Running)
        )
    }
}

/// The lifecycle status of a pipeline session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but not yet executing.
    #[default]
    Pending,
    /// Stages are being executed.
    Running,
    /// Every stage completed.
    Completed,
    /// No stage completed.
    Failed,
    /// Some stages completed, others failed or were skipped.
    Partial,
}

impl SessionStatus {
    /// Returns true once the session can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Partial)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

/// The built-in pipeline topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// A new project from scratch.
    Greenfield,
    /// Changes to an existing codebase.
    Enhancement,
    /// Work driven by imported issues.
    Import,
}

impl PipelineMode {
    /// All supported modes.
    pub const ALL: [Self; 3] = [Self::Greenfield, Self::Enhancement, Self::Import];

    /// Returns the mode's wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greenfield => "greenfield",
            Self::Enhancement => "enhancement",
            Self::Import => "import",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::UnsupportedMode {
                mode: s.to_string(),
            })
    }
}

/// How a batch of ad-hoc agent invocations is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    /// One after another, in order.
    #[default]
    Sequential,
    /// All in flight at once, awaited jointly.
    Parallel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Completed.to_string(), "completed");
        assert_eq!(StageStatus::Skipped.to_string(), "skipped");
        assert_eq!(StageStatus::Retrying.to_string(), "retrying");
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_stage_status_transitions() {
        assert!(StageStatus::Pending.can_transition_to(StageStatus::Running));
        assert!(StageStatus::Pending.can_transition_to(StageStatus::Skipped));
        assert!(StageStatus::Running.can_transition_to(StageStatus::Retrying));
        assert!(StageStatus::Retrying.can_transition_to(StageStatus::Running));
        assert!(!StageStatus::Running.can_transition_to(StageStatus::Skipped));
        assert!(!StageStatus::Failed.can_transition_to(StageStatus::Running));
        assert!(!StageStatus::Completed.can_transition_to(StageStatus::Failed));
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Failed).unwrap();
        assert_eq!(json, r#""failed""#);

        let back: StageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StageStatus::Failed);
    }

    #[test]
    fn test_pipeline_mode_from_str() {
        assert_eq!("greenfield".parse::<PipelineMode>().unwrap(), PipelineMode::Greenfield);
        assert_eq!(" Import ".parse::<PipelineMode>().unwrap(), PipelineMode::Import);

        let err = "waterfall".parse::<PipelineMode>().unwrap_err();
        assert_eq!(err.kind(), "unsupported_mode");
    }

    #[test]
    fn test_session_status_terminal() {
        assert!(SessionStatus::Partial.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }
}
