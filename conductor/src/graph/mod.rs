//! Dependency and priority analysis for dynamic work items.
//!
//! Used when the pipeline has to order a set of items discovered at runtime
//! (for example, issues to implement) instead of the fixed stage catalog.

mod analyzer;
mod item;
mod scoring;

pub use analyzer::{CriticalPath, DependencyGraph, GraphAnalysis};
pub use item::{DependencyEdge, ItemStatus, Priority, WorkItem};
pub use scoring::{PriorityScore, ScoreWeights};
