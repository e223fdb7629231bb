//! # Conductor
//!
//! A pipeline orchestration engine for multi-agent development workflows.
//!
//! Conductor provides:
//!
//! - **Stage scheduling**: fixed per-mode stage catalogs with parallel roots,
//!   in-place retries, approval gates and skip propagation
//! - **Checkpoint and resume**: every stage transition is persisted, and a
//!   later run can pick up where a previous one stopped
//! - **Dependency analysis**: layered parallel groups, cycle detection,
//!   critical path and priority scoring for dynamic work items
//! - **Crash-safe state storage**: atomic writes, lock files with expiry,
//!   an LRU/TTL read cache and coalescing write batches
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conductor::prelude::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(StateStore::new(StoreConfig::new("/path/to/project")));
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), store, executor);
//!
//! let request = SessionRequest::new("/path/to/project", "Add OAuth login").with_mode("enhancement");
//! let result = orchestrator.execute_pipeline(request).await?;
//! println!("{}: {:?}", result.pipeline_id, result.overall_status);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod pipeline;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::core::{CoordinationMode, PipelineMode, SessionStatus, StageStatus};
    pub use crate::errors::{GraphError, OrchestratorError, PipelineError, StoreError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{DependencyEdge, DependencyGraph, Priority, ScoreWeights, WorkItem};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        ApprovalDecision, ApprovalMode, ApprovalPolicy, Orchestrator, PipelineResult,
        PipelineSession, SessionRequest, StageCatalog, StageDefinition, StageExecutor,
        StageInvocation, StageResult,
    };
    pub use crate::store::{StateStore, StoreConfig};
    pub use crate::utils::Timestamp;
}
