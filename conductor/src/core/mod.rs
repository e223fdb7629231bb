//! Core domain enums for conductor.
//!
//! This module contains the status types shared across the framework:
//! - Stage and session lifecycle states
//! - Pipeline modes and agent coordination modes

mod status;

pub use status::{CoordinationMode, PipelineMode, SessionStatus, StageStatus};
