//! Approval gate for stages flagged `requires_approval`.

use super::catalog::StageDefinition;
use super::session::StageResult;
use crate::core::StageStatus;
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

/// The answer of an approval policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Whether the stage may run.
    pub approved: bool,
    /// Why.
    pub reason: String,
}

impl ApprovalDecision {
    /// An approval.
    #[must_use]
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    /// A denial.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

/// Decides whether a gated stage may run.
///
/// A denied stage is recorded as skipped, and so is everything downstream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    /// Called before a gated stage with the results recorded so far.
    async fn approve_stage(
        &self,
        stage: &StageDefinition,
        prior_results: &[StageResult],
    ) -> ApprovalDecision;
}

/// Built-in approval modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Approve everything.
    #[default]
    Auto,
    /// Deny once any earlier stage has failed.
    Critical,
    /// Wait for a human via [`ManualApproval`].
    Manual,
    /// Delegate to an injected policy.
    Custom,
}

impl ApprovalMode {
    /// The built-in policy for this mode, if it has one.
    ///
    /// `Manual` and `Custom` need a policy the host can answer or supply, so
    /// they have none; install one with `Orchestrator::with_approval_policy`.
    #[must_use]
    pub fn default_policy(self) -> Option<Arc<dyn ApprovalPolicy>> {
        match self {
            Self::Auto => Some(Arc::new(AutoApproval)),
            Self::Critical => Some(Arc::new(CriticalApproval)),
            Self::Manual | Self::Custom => None,
        }
    }

    /// The configuration name of this mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Critical => "critical",
            Self::Manual => "manual",
            Self::Custom => "custom",
        }
    }
}

/// Approves every stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApproval;

#[async_trait]
impl ApprovalPolicy for AutoApproval {
    async fn approve_stage(&self, _stage: &StageDefinition, _prior: &[StageResult]) -> ApprovalDecision {
        ApprovalDecision::approve("auto-approved")
    }
}

/// Denies a stage when any earlier stage failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CriticalApproval;

#[async_trait]
impl ApprovalPolicy for CriticalApproval {
    async fn approve_stage(&self, _stage: &StageDefinition, prior: &[StageResult]) -> ApprovalDecision {
        let failed: Vec<&str> = prior
            .iter()
            .filter(|r| r.status == StageStatus::Failed)
            .map(|r| r.name.as_str())
            .collect();
        if failed.is_empty() {
            ApprovalDecision::approve("no prior failures")
        } else {
            ApprovalDecision::deny(format!("prior stages failed: {}", failed.join(", ")))
        }
    }
}

/// Denies every stage with a fixed reason.
#[derive(Debug, Clone)]
pub struct DenyApproval {
    reason: String,
}

impl DenyApproval {
    /// Creates a policy that always denies.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ApprovalPolicy for DenyApproval {
    async fn approve_stage(&self, _stage: &StageDefinition, _prior: &[StageResult]) -> ApprovalDecision {
        ApprovalDecision::deny(self.reason.clone())
    }
}

/// A pending manual approval, as shown to whoever answers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    /// Request id to pass to `approve` or `deny`.
    pub id: Uuid,
    /// The gated stage.
    pub stage: String,
    /// The stage's agent type.
    pub agent_type: String,
    /// Stage description.
    pub description: String,
    /// When the request was raised.
    pub requested_at: Timestamp,
}

struct PendingApproval {
    request: ApprovalRequest,
    response_tx: oneshot::Sender<ApprovalDecision>,
}

/// Human-in-the-loop approval.
///
/// Each gated stage raises an [`ApprovalRequest`] and waits until someone
/// calls [`approve`](Self::approve) or [`deny`](Self::deny). Unanswered
/// requests are denied after the timeout.
pub struct ManualApproval {
    requests: RwLock<HashMap<Uuid, PendingApproval>>,
    timeout: Duration,
    notifier: Option<mpsc::UnboundedSender<ApprovalRequest>>,
}

impl ManualApproval {
    /// Creates a manual policy; poll [`pending_requests`](Self::pending_requests).
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            timeout,
            notifier: None,
        }
    }

    /// Creates a manual policy that also announces each request on a channel.
    #[must_use]
    pub fn with_channel(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut policy = Self::new(timeout);
        policy.notifier = Some(tx);
        (policy, rx)
    }

    /// Approves a pending request. Returns false if it is no longer pending.
    pub fn approve(&self, request_id: Uuid) -> bool {
        self.answer(request_id, ApprovalDecision::approve("approved by operator"))
    }

    /// Denies a pending request.
    pub fn deny(&self, request_id: Uuid, reason: impl Into<String>) -> bool {
        self.answer(request_id, ApprovalDecision::deny(reason))
    }

    /// Withdraws a pending request; the waiting stage is denied.
    pub fn cancel(&self, request_id: Uuid) -> bool {
        self.requests.write().remove(&request_id).is_some()
    }

    /// Number of unanswered requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.requests.read().len()
    }

    /// Unanswered requests, oldest first.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<_> = self
            .requests
            .read()
            .values()
            .map(|p| p.request.clone())
            .collect();
        pending.sort_by_key(|r| r.requested_at);
        pending
    }

    fn answer(&self, request_id: Uuid, decision: ApprovalDecision) -> bool {
        let Some(pending) = self.requests.write().remove(&request_id) else {
            return false;
        };
        info!(
            stage = %pending.request.stage,
            approved = decision.approved,
            "Approval answered"
        );
        pending.response_tx.send(decision).is_ok()
    }
}

#[async_trait]
impl ApprovalPolicy for ManualApproval {
    async fn approve_stage(&self, stage: &StageDefinition, _prior: &[StageResult]) -> ApprovalDecision {
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            stage: stage.name.clone(),
            agent_type: stage.agent_type.clone(),
            description: stage.description.clone(),
            requested_at: now_utc(),
        };
        let request_id = request.id;
        let (tx, rx) = oneshot::channel();

        self.requests.write().insert(
            request_id,
            PendingApproval {
                request: request.clone(),
                response_tx: tx,
            },
        );
        if let Some(notifier) = &self.notifier {
            let _ = notifier.send(request);
        }
        debug!(stage = %stage.name, %request_id, "Waiting for approval");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => {
                self.requests.write().remove(&request_id);
                ApprovalDecision::deny("approval request cancelled")
            }
            Err(_) => {
                self.requests.write().remove(&request_id);
                ApprovalDecision::deny(format!(
                    "approval timed out after {}ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

impl std::fmt::Debug for ManualApproval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualApproval")
            .field("pending_count", &self.pending_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gated() -> StageDefinition {
        StageDefinition::new("implementation", "developer").requiring_approval()
    }

    fn result(name: &str, status: StageStatus) -> StageResult {
        let stage = StageDefinition::new(name, "agent");
        match status {
            StageStatus::Failed => StageResult::failed(&stage, 1, 3, "boom"),
            StageStatus::Skipped => StageResult::skipped(&stage, "dependency failed"),
            _ => StageResult::completed(&stage, 1, 0),
        }
    }

    #[tokio::test]
    async fn test_auto_approves() {
        let decision = AutoApproval
            .approve_stage(&gated(), &[result("a", StageStatus::Failed)])
            .await;
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn test_critical_denies_after_failure() {
        let prior = [result("a", StageStatus::Completed), result("b", StageStatus::Failed)];
        let decision = CriticalApproval.approve_stage(&gated(), &prior).await;

        assert!(!decision.approved);
        assert!(decision.reason.contains('b'));
    }

    #[tokio::test]
    async fn test_critical_ignores_skips() {
        let prior = [result("a", StageStatus::Completed), result("b", StageStatus::Skipped)];
        assert!(CriticalApproval.approve_stage(&gated(), &prior).await.approved);
    }

    #[test]
    fn test_manual_and_custom_have_no_builtin_policy() {
        assert!(ApprovalMode::Manual.default_policy().is_none());
        assert!(ApprovalMode::Custom.default_policy().is_none());
        assert_eq!(ApprovalMode::Manual.as_str(), "manual");
    }

    #[tokio::test]
    async fn test_deny_policy_reports_reason() {
        let decision = DenyApproval::new("frozen").approve_stage(&gated(), &[]).await;
        assert!(!decision.approved);
        assert_eq!(decision.reason, "frozen");
    }

    #[tokio::test]
    async fn test_manual_approved() {
        let (policy, mut requests) = ManualApproval::with_channel(Duration::from_secs(5));
        let policy = Arc::new(policy);
        let waiting = Arc::clone(&policy);

        let handle = tokio::spawn(async move { waiting.approve_stage(&gated(), &[]).await });

        let request = requests.recv().await.unwrap();
        assert_eq!(request.stage, "implementation");
        assert_eq!(policy.pending_count(), 1);
        assert!(policy.approve(request.id));

        let decision = handle.await.unwrap();
        assert!(decision.approved);
        assert_eq!(policy.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_manual_denied_with_reason() {
        let (policy, mut requests) = ManualApproval::with_channel(Duration::from_secs(5));
        let policy = Arc::new(policy);
        let waiting = Arc::clone(&policy);

        let handle = tokio::spawn(async move { waiting.approve_stage(&gated(), &[]).await });

        let request = requests.recv().await.unwrap();
        assert!(policy.deny(request.id, "not during release freeze"));
        assert!(!policy.approve(request.id));

        let decision = handle.await.unwrap();
        assert_eq!(decision, ApprovalDecision::deny("not during release freeze"));
    }

    #[tokio::test]
    async fn test_manual_cancel_denies() {
        let (policy, mut requests) = ManualApproval::with_channel(Duration::from_secs(5));
        let policy = Arc::new(policy);
        let waiting = Arc::clone(&policy);

        let handle = tokio::spawn(async move { waiting.approve_stage(&gated(), &[]).await });

        let request = requests.recv().await.unwrap();
        assert!(policy.cancel(request.id));

        let decision = handle.await.unwrap();
        assert!(!decision.approved);
        assert!(decision.reason.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_manual_timeout_denies() {
        let policy = ManualApproval::new(Duration::from_millis(30));
        let decision = policy.approve_stage(&gated(), &[]).await;

        assert!(!decision.approved);
        assert!(decision.reason.contains("timed out"));
        assert!(policy.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_mock_policy_sees_prior_results() {
        let mut mock = MockApprovalPolicy::new();
        mock.expect_approve_stage()
            .withf(|stage, prior| stage.name == "implementation" && prior.len() == 2)
            .times(1)
            .returning(|_, _| ApprovalDecision::deny("mocked"));

        let prior = [result("a", StageStatus::Completed), result("b", StageStatus::Completed)];
        let decision = mock.approve_stage(&gated(), &prior).await;
        assert_eq!(decision.reason, "mocked");
    }

    #[test]
    fn test_default_policies_from_sync_code() {
        let auto = ApprovalMode::Auto.default_policy().unwrap();
        let critical = ApprovalMode::Critical.default_policy().unwrap();
        let prior = [result("a", StageStatus::Failed)];

        assert!(tokio_test::block_on(auto.approve_stage(&gated(), &prior)).approved);
        assert!(!tokio_test::block_on(critical.approve_stage(&gated(), &prior)).approved);
    }

    #[test]
    fn test_approval_mode_serde() {
        let mode: ApprovalMode = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(mode, ApprovalMode::Critical);
        assert_eq!(ApprovalMode::default(), ApprovalMode::Auto);
    }
}
