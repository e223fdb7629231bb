//! Error types for the conductor orchestration engine.
//!
//! Errors are grouped by the layer that raises them: the state store, the
//! dependency graph analyzer and the pipeline scheduler. Every variant carries
//! a stable discriminator (`kind()`) and the structured context needed to act
//! on it (`to_dict()`).

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The crate-level error type.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A persistence-layer error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A dependency graph error.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A scheduling or session error.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl OrchestratorError {
    /// Returns the stable discriminator of the underlying error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(e) => e.kind(),
            Self::Graph(e) => e.kind(),
            Self::Pipeline(e) => e.kind(),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        match self {
            Self::Store(e) => e.to_dict(),
            Self::Graph(e) => e.to_dict(),
            Self::Pipeline(e) => e.to_dict(),
        }
    }
}

/// Errors raised by the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The lock could not be acquired within the configured attempts.
    #[error("Lock contention on '{}' after {attempts} attempts", path.display())]
    LockContention {
        /// The protected path.
        path: PathBuf,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A release was attempted by a holder that does not own the lock.
    #[error("Lock on '{}' is held by '{holder}', release requested by '{requester}'", path.display())]
    LockHolderMismatch {
        /// The protected path.
        path: PathBuf,
        /// The recorded holder.
        holder: String,
        /// The holder that asked for release.
        requester: String,
    },

    /// A queued write was replaced by an immediate write to the same path.
    #[error("Queued write to '{}' superseded by an immediate write", path.display())]
    Superseded {
        /// The target path.
        path: PathBuf,
    },

    /// The write batcher has been closed.
    #[error("Write batcher is closed")]
    BatcherClosed,

    /// A queued write was dropped without being flushed.
    #[error("Queued write to '{}' was abandoned before flushing", path.display())]
    WriteAbandoned {
        /// The target path.
        path: PathBuf,
    },

    /// A batched write failed during flush.
    #[error("Flush of '{}' failed: {reason}", path.display())]
    FlushFailed {
        /// The target path.
        path: PathBuf,
        /// The underlying failure.
        reason: String,
    },

    /// A filesystem operation failed.
    #[error("Failed to {operation} '{}': {source}", path.display())]
    Io {
        /// The operation attempted.
        operation: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Stored content could not be decoded.
    #[error("Failed to decode '{}' as {format}: {reason}", path.display())]
    Decode {
        /// The path read.
        path: PathBuf,
        /// The expected format.
        format: &'static str,
        /// The decoder message.
        reason: String,
    },

    /// A value could not be encoded.
    #[error("Failed to encode value for '{}' as {format}: {reason}", path.display())]
    Encode {
        /// The target path.
        path: PathBuf,
        /// The requested format.
        format: &'static str,
        /// The encoder message.
        reason: String,
    },
}

impl StoreError {
    /// Creates an IO error for the given operation and path.
    #[must_use]
    pub fn io(operation: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Returns the stable discriminator.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LockContention { .. } => "lock_contention",
            Self::LockHolderMismatch { .. } => "lock_holder_mismatch",
            Self::Superseded { .. } => "write_superseded",
            Self::BatcherClosed => "batcher_closed",
            Self::WriteAbandoned { .. } => "write_abandoned",
            Self::FlushFailed { .. } => "flush_failed",
            Self::Io { .. } => "io",
            Self::Decode { .. } => "decode",
            Self::Encode { .. } => "encode",
        }
    }

    /// Returns true if the caller may retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention { .. } | Self::FlushFailed { .. })
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), json!(self.kind()));
        match self {
            Self::LockContention { path, attempts } => {
                map.insert("path".to_string(), json!(path.display().to_string()));
                map.insert("attempts".to_string(), json!(attempts));
            }
            Self::LockHolderMismatch {
                path,
                holder,
                requester,
            } => {
                map.insert("path".to_string(), json!(path.display().to_string()));
                map.insert("holder".to_string(), json!(holder));
                map.insert("requester".to_string(), json!(requester));
            }
            Self::Superseded { path } | Self::WriteAbandoned { path } => {
                map.insert("path".to_string(), json!(path.display().to_string()));
            }
            Self::FlushFailed { path, reason } => {
                map.insert("path".to_string(), json!(path.display().to_string()));
                map.insert("reason".to_string(), json!(reason));
            }
            Self::Io {
                operation, path, ..
            } => {
                map.insert("operation".to_string(), json!(operation));
                map.insert("path".to_string(), json!(path.display().to_string()));
            }
            Self::Decode { path, format, reason } | Self::Encode { path, format, reason } => {
                map.insert("path".to_string(), json!(path.display().to_string()));
                map.insert("format".to_string(), json!(format));
                map.insert("reason".to_string(), json!(reason));
            }
            Self::BatcherClosed => {}
        }
        map.insert("message".to_string(), json!(self.to_string()));
        map
    }
}

/// Errors raised by the dependency graph analyzer.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// The graph has no items.
    #[error("Dependency graph is empty")]
    EmptyGraph,

    /// The graph contains a cycle.
    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency {
        /// The items forming the cycle, first item repeated at the end.
        cycle: Vec<String>,
    },

    /// The graph input is malformed (dangling or duplicate reference).
    #[error("Graph validation failed: {message}")]
    Validation {
        /// Description of the problem.
        message: String,
        /// The item whose declaration is invalid.
        item: Option<String>,
        /// The unknown or duplicated id.
        reference: Option<String>,
    },

    /// A lookup referenced an id not present in the graph.
    #[error("Issue not found: {id}")]
    IssueNotFound {
        /// The missing id.
        id: String,
    },
}

impl GraphError {
    /// Creates a validation error for a dangling reference.
    #[must_use]
    pub fn dangling(item: impl Into<String>, reference: impl Into<String>) -> Self {
        let item = item.into();
        let reference = reference.into();
        Self::Validation {
            message: format!("'{item}' references unknown item '{reference}'"),
            item: Some(item),
            reference: Some(reference),
        }
    }

    /// Returns the stable discriminator.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyGraph => "empty_graph",
            Self::CircularDependency { .. } => "circular_dependency",
            Self::Validation { .. } => "graph_validation",
            Self::IssueNotFound { .. } => "issue_not_found",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), json!(self.kind()));
        match self {
            Self::EmptyGraph => {}
            Self::CircularDependency { cycle } => {
                map.insert("cycle".to_string(), json!(cycle));
            }
            Self::Validation {
                item, reference, ..
            } => {
                map.insert("item".to_string(), json!(item));
                map.insert("reference".to_string(), json!(reference));
            }
            Self::IssueNotFound { id } => {
                map.insert("id".to_string(), json!(id));
            }
        }
        map.insert("message".to_string(), json!(self.to_string()));
        map
    }
}

/// Errors raised by the stage scheduler and session handling.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The project directory is missing or not a directory.
    #[error("Invalid project directory '{}': {reason}", path.display())]
    InvalidProjectDir {
        /// The rejected path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// The requested pipeline mode does not exist.
    #[error("Unsupported pipeline mode: {mode}")]
    UnsupportedMode {
        /// The rejected mode string.
        mode: String,
    },

    /// A stage catalog failed construction-time validation.
    #[error("Invalid stage catalog for '{mode}': {message}")]
    InvalidCatalog {
        /// The catalog's mode.
        mode: String,
        /// Description of the problem.
        message: String,
        /// The stages involved.
        stages: Vec<String>,
    },

    /// The approval mode needs a policy the host never installed.
    #[error("Approval mode '{mode}' requires an installed approval policy")]
    MissingApprovalPolicy {
        /// The configured approval mode.
        mode: String,
    },

    /// A session is already running on this orchestrator.
    #[error("Session '{session_id}' is already running")]
    SessionAlreadyRunning {
        /// The running session.
        session_id: String,
    },

    /// No persisted record exists for the session.
    #[error("Session '{session_id}' not found at '{}'", path.display())]
    SessionNotFound {
        /// The requested session.
        session_id: String,
        /// Where the record was expected.
        path: PathBuf,
    },

    /// A persisted session record is unusable.
    #[error("Session '{session_id}' is corrupted: {reason}")]
    CorruptedSession {
        /// The requested session.
        session_id: String,
        /// The record's location.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// A stage invocation exceeded its timeout.
    #[error("Stage '{stage}' timed out after {timeout_ms}ms")]
    StageTimeout {
        /// The stage name.
        stage: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// A stage exhausted its retry budget.
    #[error("Stage '{stage}' failed after {attempts} attempts: {reason}")]
    StageFailed {
        /// The stage name.
        stage: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// The last error.
        reason: String,
    },

    /// No stage completed and at least one failed.
    #[error("Pipeline '{pipeline_id}' failed: {}", failed_stages.join(", "))]
    PipelineFailed {
        /// The session id of the failed run.
        pipeline_id: String,
        /// Stages that ended in `failed`.
        failed_stages: Vec<String>,
    },
}

impl PipelineError {
    /// Returns the stable discriminator.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidProjectDir { .. } => "invalid_project_dir",
            Self::UnsupportedMode { .. } => "unsupported_mode",
            Self::InvalidCatalog { .. } => "invalid_catalog",
            Self::MissingApprovalPolicy { .. } => "missing_approval_policy",
            Self::SessionAlreadyRunning { .. } => "session_already_running",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::CorruptedSession { .. } => "corrupted_session",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::StageFailed { .. } => "stage_failed",
            Self::PipelineFailed { .. } => "pipeline_failed",
        }
    }

    /// Returns true for errors raised before any scheduling work begins.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidProjectDir { .. }
                | Self::UnsupportedMode { .. }
                | Self::InvalidCatalog { .. }
                | Self::MissingApprovalPolicy { .. }
        )
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), json!(self.kind()));
        match self {
            Self::InvalidProjectDir { path, reason } => {
                map.insert("path".to_string(), json!(path.display().to_string()));
                map.insert("reason".to_string(), json!(reason));
            }
            Self::UnsupportedMode { mode } | Self::MissingApprovalPolicy { mode } => {
                map.insert("mode".to_string(), json!(mode));
            }
            Self::InvalidCatalog { mode, stages, .. } => {
                map.insert("mode".to_string(), json!(mode));
                map.insert("stages".to_string(), json!(stages));
            }
            Self::SessionAlreadyRunning { session_id } => {
                map.insert("session_id".to_string(), json!(session_id));
            }
            Self::SessionNotFound { session_id, path }
            | Self::CorruptedSession {
                session_id, path, ..
            } => {
                map.insert("session_id".to_string(), json!(session_id));
                map.insert("path".to_string(), json!(path.display().to_string()));
            }
            Self::StageTimeout { stage, timeout_ms } => {
                map.insert("stage".to_string(), json!(stage));
                map.insert("timeout_ms".to_string(), json!(timeout_ms));
            }
            Self::StageFailed {
                stage, attempts, ..
            } => {
                map.insert("stage".to_string(), json!(stage));
                map.insert("attempts".to_string(), json!(attempts));
            }
            Self::PipelineFailed {
                pipeline_id,
                failed_stages,
            } => {
                map.insert("pipeline_id".to_string(), json!(pipeline_id));
                map.insert("failed_stages".to_string(), json!(failed_stages));
            }
        }
        map.insert("message".to_string(), json!(self.to_string()));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_carries_context() {
        let err = StoreError::LockContention {
            path: PathBuf::from("/tmp/state.json"),
            attempts: 5,
        };

        assert_eq!(err.kind(), "lock_contention");
        assert!(err.is_retryable());
        let dict = err.to_dict();
        assert_eq!(dict.get("attempts").unwrap(), 5);
        assert_eq!(dict.get("path").unwrap(), "/tmp/state.json");
    }

    #[test]
    fn test_cycle_error_message() {
        let err = GraphError::CircularDependency {
            cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        };

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.kind(), "circular_dependency");
    }

    #[test]
    fn test_dangling_reference() {
        let err = GraphError::dangling("issue-2", "issue-9");
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "graph_validation");
        assert_eq!(dict.get("reference").unwrap(), "issue-9");
    }

    #[test]
    fn test_pipeline_failed_lists_stages() {
        let err = PipelineError::PipelineFailed {
            pipeline_id: "p1".into(),
            failed_stages: vec!["requirements".into(), "ux-research".into()],
        };

        assert!(err.to_string().contains("requirements, ux-research"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_orchestrator_error_delegates_kind() {
        let err: OrchestratorError = PipelineError::UnsupportedMode {
            mode: "legacy".into(),
        }
        .into();

        assert_eq!(err.kind(), "unsupported_mode");
        assert_eq!(err.to_dict().get("mode").unwrap(), "legacy");
    }
}
