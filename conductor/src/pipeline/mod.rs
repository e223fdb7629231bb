//! Pipeline scheduling and session management.
//!
//! This module provides:
//! - Stage catalogs for each pipeline mode
//! - The scheduler (`Orchestrator`) with retries, approval gates and resume
//! - Session records and their persistence
//! - The executor seam through which agents are invoked

mod approval;
mod catalog;
mod executor;
mod retry;
mod scheduler;
mod session;


pub use approval::{
    ApprovalDecision, ApprovalMode, ApprovalPolicy, ApprovalRequest, AutoApproval,
    CriticalApproval, DenyApproval, ManualApproval,
};
pub use catalog::{PlanStep, StageCatalog, StageDefinition};
pub use executor::{AgentExecution, StageExecutor, StageInvocation};
pub use retry::{
    run_with_retry, should_retry, Attempted, BackoffStrategy, JitterStrategy, NoDelay,
    RetryConfig, RetryDecision, RetryState, Sleeper, TokioSleeper,
};
pub use scheduler::{
    MonitorSnapshot, Orchestrator, PipelineResult, SessionRequest, StageSummary, StatusReport,
};
pub use session::{PipelineSession, SessionStore, StageResult};
