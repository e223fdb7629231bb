//! Event emission for pipeline observability.
//!
//! The orchestrator reports every stage transition to an [`EventSink`].
//! Event names are listed in [`names`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event names emitted by the orchestrator.
pub mod names {
    /// A session began executing.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A session reached a terminal status.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A stage attempt began.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage attempt failed and will be retried.
    pub const STAGE_RETRYING: &str = "stage.retrying";
    /// A stage completed.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage exhausted its retries.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage was skipped because a dependency did not complete.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// The approval gate denied a stage.
    pub const STAGE_APPROVAL_DENIED: &str = "stage.approval_denied";
    /// An ad-hoc agent invocation finished.
    pub const AGENT_INVOKED: &str = "agent.invoked";
}
