//! Testing utilities for conductor pipelines.
//!
//! This module provides:
//! - Scripted and recording executors
//! - A temporary project fixture with its own state store
//! - Assertions on pipeline results

mod assertions;
mod fixtures;
mod mocks;

pub use crate::pipeline::NoDelay;
pub use assertions::{
    assert_pipeline_status, assert_retry_count, assert_stage_status, assert_stage_statuses,
};
pub use fixtures::TestProject;
pub use mocks::{RecordingExecutor, ScriptedExecutor};
