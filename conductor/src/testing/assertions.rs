//! Test assertions for pipeline results.

use crate::core::{SessionStatus, StageStatus};
use crate::pipeline::PipelineResult;

/// Asserts the overall status of a run.
pub fn assert_pipeline_status(result: &PipelineResult, expected: SessionStatus) {
    assert_eq!(
        result.overall_status, expected,
        "Expected pipeline status {expected}, got {}. Warnings: {:?}",
        result.overall_status, result.warnings
    );
}

/// Asserts the status of one stage.
pub fn assert_stage_status(result: &PipelineResult, stage: &str, expected: StageStatus) {
    let actual = result.stage(stage).map(|r| r.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{stage}' to be {expected}, got {actual:?}"
    );
}

/// Asserts the statuses of every stage, in catalog order.
pub fn assert_stage_statuses(result: &PipelineResult, expected: &[(&str, StageStatus)]) {
    let actual: Vec<(&str, StageStatus)> = result
        .stages
        .iter()
        .map(|r| (r.name.as_str(), r.status))
        .collect();
    assert_eq!(actual, expected, "Stage statuses differ");
}

/// Asserts that a stage was retried exactly `retries` times.
pub fn assert_retry_count(result: &PipelineResult, stage: &str, retries: u32) {
    let actual = result.stage(stage).map(|r| r.retry_count);
    assert_eq!(
        actual,
        Some(retries),
        "Expected stage '{stage}' to be retried {retries} times, got {actual:?}"
    );
}
