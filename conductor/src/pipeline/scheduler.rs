//! The stage scheduler.
//!
//! Runs a mode's stage catalog against a [`StageExecutor`]: parallel roots
//! first, then every other stage in declaration order. Each stage is retried
//! in place, gated by the approval policy when flagged, and skipped when a
//! dependency did not complete. The session is checkpointed after every
//! stage transition so a later run can resume from it.

use super::approval::ApprovalPolicy;
use super::catalog::{PlanStep, StageCatalog, StageDefinition};
use super::executor::{AgentExecution, StageExecutor, StageInvocation};
use super::retry::{run_with_retry, Sleeper, TokioSleeper};
use super::session::{PipelineSession, SessionStore, StageResult};
use crate::config::OrchestratorConfig;
use crate::core::{CoordinationMode, PipelineMode, SessionStatus, StageStatus};
use crate::errors::{GraphError, OrchestratorError, PipelineError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::graph::{DependencyEdge, DependencyGraph, GraphAnalysis, WorkItem};
use crate::observability::SpanTimer;
use crate::store::StateStore;
use crate::utils::{duration_ms, now_utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Project the run operates on; must be an existing directory.
    pub project_dir: PathBuf,
    /// The user's request, passed through to the session.
    pub user_request: String,
    /// Pipeline mode name. Required unless resuming.
    pub mode: Option<String>,
    /// Prior session to resume.
    pub resume_from: Option<String>,
}

impl SessionRequest {
    /// Creates a request with no mode set.
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, user_request: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            user_request: user_request.into(),
            mode: None,
            resume_from: None,
        }
    }

    /// Sets the mode by name.
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Resumes a prior session.
    #[must_use]
    pub fn resuming(mut self, session_id: impl Into<String>) -> Self {
        self.resume_from = Some(session_id.into());
        self
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// The session id.
    pub pipeline_id: String,
    /// The mode that ran.
    pub mode: PipelineMode,
    /// `completed`, `partial` or `failed`.
    pub overall_status: SessionStatus,
    /// Stage results in catalog order.
    pub stages: Vec<StageResult>,
    /// Wall-clock duration of this run.
    pub duration_ms: u64,
    /// Human-readable notes on what did not complete.
    pub warnings: Vec<String>,
    /// The session this run resumed.
    pub resumed_from: Option<String>,
}

impl PipelineResult {
    /// The result for one stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.name == name)
    }

    /// Statuses in catalog order.
    #[must_use]
    pub fn statuses(&self) -> Vec<StageStatus> {
        self.stages.iter().map(|r| r.status).collect()
    }
}

/// The current or last session, as reported by `get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Session id, if any session has started.
    pub session_id: Option<String>,
    /// Session status.
    pub status: Option<SessionStatus>,
    /// Results recorded so far.
    pub stages: Vec<StageResult>,
}

/// Per-stage line of a [`MonitorSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    /// Stage name.
    pub name: String,
    /// Live status.
    pub status: StageStatus,
    /// Duration once finished.
    pub duration_ms: u64,
    /// Retries so far.
    pub retry_count: u32,
}

/// Live progress of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    /// Session id.
    pub session_id: String,
    /// Session status.
    pub status: SessionStatus,
    /// First running stage in catalog order.
    pub current_stage: Option<String>,
    /// Every stage currently running or retrying.
    pub running_stages: Vec<String>,
    /// Stages in the catalog.
    pub total_stages: usize,
    /// Completed stages.
    pub completed_stages: usize,
    /// Failed stages.
    pub failed_stages: usize,
    /// Skipped stages.
    pub skipped_stages: usize,
    /// Time since the run started, or its total duration once finished.
    pub elapsed_ms: u64,
    /// Every catalog stage with its live status.
    pub stages: Vec<StageSummary>,
}

struct LiveRun {
    session: PipelineSession,
    stage_order: Vec<String>,
    in_progress: HashMap<String, (StageStatus, u32)>,
    started: Instant,
    finished_ms: Option<u64>,
}

impl LiveRun {
    fn snapshot(&self) -> MonitorSnapshot {
        let count = |status: StageStatus| {
            self.session
                .stage_results
                .iter()
                .filter(|r| r.status == status)
                .count()
        };

        let stages: Vec<StageSummary> = self
            .stage_order
            .iter()
            .map(|name| match self.session.result_for(name) {
                Some(result) => StageSummary {
                    name: name.clone(),
                    status: result.status,
                    duration_ms: result.duration_ms,
                    retry_count: result.retry_count,
                },
                None => {
                    let (status, retries) = self
                        .in_progress
                        .get(name)
                        .copied()
                        .unwrap_or((StageStatus::Pending, 0));
                    StageSummary {
                        name: name.clone(),
                        status,
                        duration_ms: 0,
                        retry_count: retries,
                    }
                }
            })
            .collect();

        let running_stages: Vec<String> = self
            .stage_order
            .iter()
            .filter(|name| self.in_progress.contains_key(*name))
            .cloned()
            .collect();

        MonitorSnapshot {
            session_id: self.session.session_id.clone(),
            status: self.session.status,
            current_stage: running_stages.first().cloned(),
            running_stages,
            total_stages: self.stage_order.len(),
            completed_stages: count(StageStatus::Completed),
            failed_stages: count(StageStatus::Failed),
            skipped_stages: count(StageStatus::Skipped),
            elapsed_ms: self
                .finished_ms
                .unwrap_or_else(|| duration_ms(self.started.elapsed())),
            stages,
        }
    }
}

struct ActiveRun<'a> {
    slot: &'a Mutex<Option<String>>,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// Drives pipeline sessions.
pub struct Orchestrator {
    config: OrchestratorConfig,
    sessions: SessionStore,
    executor: Arc<dyn StageExecutor>,
    approval: Option<Arc<dyn ApprovalPolicy>>,
    sleeper: Arc<dyn Sleeper>,
    events: Arc<dyn EventSink>,
    catalogs: HashMap<PipelineMode, StageCatalog>,
    active: Mutex<Option<String>>,
    live: RwLock<Option<LiveRun>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("active", &*self.active.lock())
            .field("custom_catalogs", &self.catalogs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator persisting through `store`.
    ///
    /// The approval policy follows `config.approval_mode`. The `manual` and
    /// `custom` modes have no built-in policy, so sessions are rejected until
    /// one is installed with [`with_approval_policy`](Self::with_approval_policy).
    /// Events are discarded until a sink is installed.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<StateStore>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        let sessions = SessionStore::new(store, &config.state_dir_name, config.durable_checkpoints);
        let approval = config.approval_mode.default_policy();
        Self {
            config,
            sessions,
            executor,
            approval,
            sleeper: Arc::new(TokioSleeper),
            events: Arc::new(NoOpEventSink),
            catalogs: HashMap::new(),
            active: Mutex::new(None),
            live: RwLock::new(None),
        }
    }

    /// Installs an approval policy, overriding the configured mode.
    #[must_use]
    pub fn with_approval_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.approval = Some(policy);
        self
    }

    /// Replaces the delay used between retries.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Installs an event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Replaces the built-in catalog of the catalog's mode.
    #[must_use]
    pub fn with_catalog(mut self, catalog: StageCatalog) -> Self {
        self.catalogs.insert(catalog.mode(), catalog);
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The session store.
    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The catalog used for `mode`.
    pub fn catalog_for(&self, mode: PipelineMode) -> Result<StageCatalog, PipelineError> {
        match self.catalogs.get(&mode) {
            Some(catalog) => Ok(catalog.clone()),
            None => StageCatalog::for_mode(mode),
        }
    }

    /// Creates and persists a new session, or a resumption of a prior one.
    ///
    /// Configuration problems (missing project directory, unknown mode,
    /// an approval mode without a policy, a session already running) are
    /// reported before anything runs.
    pub async fn start_session(
        &self,
        request: SessionRequest,
    ) -> Result<PipelineSession, OrchestratorError> {
        if let Some(running) = self.active.lock().clone() {
            return Err(PipelineError::SessionAlreadyRunning {
                session_id: running,
            }
            .into());
        }
        validate_project_dir(&request.project_dir)?;
        self.approval_policy()?;

        let session = match request.resume_from.as_deref() {
            Some(prior_id) => self.resume_session(prior_id, &request).await?,
            None => {
                let mode: PipelineMode = request
                    .mode
                    .as_deref()
                    .ok_or_else(|| PipelineError::UnsupportedMode {
                        mode: String::new(),
                    })?
                    .parse()?;
                PipelineSession::new(&request.project_dir, &request.user_request, mode)
            }
        };

        self.catalog_for(session.mode)?;
        self.sessions.save(&session).await?;
        info!(
            session_id = %session.session_id,
            mode = %session.mode,
            resumed_from = ?session.resumed_from,
            "Session started"
        );
        Ok(session)
    }

    fn approval_policy(&self) -> Result<&Arc<dyn ApprovalPolicy>, PipelineError> {
        self.approval
            .as_ref()
            .ok_or_else(|| PipelineError::MissingApprovalPolicy {
                mode: self.config.approval_mode.as_str().to_string(),
            })
    }

    async fn resume_session(
        &self,
        prior_id: &str,
        request: &SessionRequest,
    ) -> Result<PipelineSession, OrchestratorError> {
        let prior = self
            .sessions
            .load_prior_session(prior_id, &request.project_dir)
            .await?;
        let catalog = self.catalog_for(prior.mode)?;

        if let Some(requested) = request.mode.as_deref() {
            if requested.parse::<PipelineMode>().ok() != Some(prior.mode) {
                warn!(
                    requested,
                    mode = %prior.mode,
                    "Resuming with the prior session's mode"
                );
            }
        }

        let user_request = if request.user_request.is_empty() {
            prior.user_request.clone()
        } else {
            request.user_request.clone()
        };
        let mut session = PipelineSession::new(&request.project_dir, user_request, prior.mode);
        session.resumed_from = Some(prior.session_id.clone());

        for result in prior.stage_results {
            if result.status == StageStatus::Completed && catalog.position(&result.name).is_some() {
                session.pre_completed_stages.push(result.name.clone());
                session.record(result);
            }
        }
        debug!(
            prior = %prior.session_id,
            pre_completed = ?session.pre_completed_stages,
            "Resuming session"
        );
        Ok(session)
    }

    /// Runs a started session to completion.
    ///
    /// Returns the summary for `completed` and `partial` runs. A run in which
    /// nothing completed and at least one stage failed is an error.
    pub async fn run_session(
        &self,
        mut session: PipelineSession,
    ) -> Result<PipelineResult, OrchestratorError> {
        let _active = self.activate(&session.session_id)?;
        let catalog = self.catalog_for(session.mode)?;
        let approval = Arc::clone(self.approval_policy()?);
        let timer = SpanTimer::start(format!("pipeline:{}", session.session_id));

        if session.is_finished() {
            warn!(session_id = %session.session_id, "Session already finished, not re-running");
            let warnings = summarize(&session);
            return Ok(result_of(&session, timer.finish(), warnings));
        }

        session.status = SessionStatus::Running;
        self.begin_live(&session, &catalog);

        if let Err(e) = self.drive(&mut session, &catalog, approval.as_ref()).await {
            session.status = SessionStatus::Failed;
            session.completed_at = Some(now_utc());
            self.finish_live(&session, timer.elapsed_ms());
            warn!(session_id = %session.session_id, error = %e, "Pipeline aborted");
            return Err(e);
        }

        session
            .stage_results
            .sort_by_key(|r| catalog.position(&r.name).unwrap_or(usize::MAX));
        let completed = session.stages_with(StageStatus::Completed);
        let failed = session.stages_with(StageStatus::Failed);
        let skipped = session.stages_with(StageStatus::Skipped);

        session.status = if completed.len() == catalog.len() {
            SessionStatus::Completed
        } else if completed.is_empty() {
            SessionStatus::Failed
        } else {
            SessionStatus::Partial
        };
        session.completed_at = Some(now_utc());
        let warnings = summarize(&session);

        self.sessions.save(&session).await?;
        if !self.config.durable_checkpoints {
            self.sessions.flush().await?;
        }

        let elapsed = timer.finish();
        self.finish_live(&session, elapsed);
        self.events
            .emit(
                names::PIPELINE_COMPLETED,
                Some(json!({
                    "session_id": session.session_id,
                    "status": session.status,
                    "completed": completed,
                    "failed": failed,
                    "skipped": skipped,
                    "duration_ms": elapsed,
                })),
            )
            .await;
        info!(
            session_id = %session.session_id,
            status = %session.status,
            completed = completed.len(),
            failed = failed.len(),
            skipped = skipped.len(),
            duration_ms = elapsed,
            "Pipeline finished"
        );

        if session.status == SessionStatus::Failed && !failed.is_empty() {
            return Err(PipelineError::PipelineFailed {
                pipeline_id: session.session_id,
                failed_stages: failed,
            }
            .into());
        }
        Ok(result_of(&session, elapsed, warnings))
    }

    /// Starts a session and runs it.
    pub async fn execute_pipeline(
        &self,
        request: SessionRequest,
    ) -> Result<PipelineResult, OrchestratorError> {
        let session = self.start_session(request).await?;
        self.run_session(session).await
    }

    async fn drive(
        &self,
        session: &mut PipelineSession,
        catalog: &StageCatalog,
        approval: &dyn ApprovalPolicy,
    ) -> Result<(), OrchestratorError> {
        self.sessions.save(session).await?;
        self.events
            .emit(
                names::PIPELINE_STARTED,
                Some(json!({
                    "session_id": session.session_id,
                    "mode": session.mode,
                    "stages": catalog.names(),
                    "resumed_from": session.resumed_from,
                })),
            )
            .await;
        info!(
            session_id = %session.session_id,
            mode = %session.mode,
            stages = catalog.len(),
            "Pipeline started"
        );

        let pre_completed: HashSet<String> = session.pre_completed_stages.iter().cloned().collect();

        for step in catalog.execution_plan() {
            let group = match step {
                PlanStep::Parallel(roots) => roots,
                PlanStep::Sequential(stage) => std::slice::from_ref(stage),
            };

            let mut runnable = Vec::with_capacity(group.len());
            for stage in group {
                let already_done = pre_completed.contains(&stage.name)
                    && session
                        .result_for(&stage.name)
                        .is_some_and(|r| r.status == StageStatus::Completed);
                if already_done {
                    debug!(stage = %stage.name, "Stage completed in prior session");
                    continue;
                }
                match self.gate(stage, session, approval).await {
                    Some(skipped) => self.record(session, skipped).await?,
                    None => runnable.push(stage),
                }
            }
            if runnable.is_empty() {
                continue;
            }

            let snapshot = session.clone();
            let mut in_flight: FuturesUnordered<_> = runnable
                .into_iter()
                .map(|stage| self.run_stage(stage, &snapshot))
                .collect();
            while let Some(result) = in_flight.next().await {
                self.record(session, result).await?;
            }
        }
        Ok(())
    }

    /// Returns a skip result if the stage must not run.
    async fn gate(
        &self,
        stage: &StageDefinition,
        session: &PipelineSession,
        approval: &dyn ApprovalPolicy,
    ) -> Option<StageResult> {
        for dep in &stage.depends_on {
            let reason = match session.result_for(dep) {
                Some(result) if result.status == StageStatus::Completed => continue,
                Some(result) => format!("dependency '{dep}' {}", result.status),
                None => format!("dependency '{dep}' did not run"),
            };
            return Some(self.skip(stage, session, reason));
        }

        if stage.requires_approval {
            let decision = approval.approve_stage(stage, &session.stage_results).await;
            if !decision.approved {
                self.events.try_emit(
                    names::STAGE_APPROVAL_DENIED,
                    Some(json!({
                        "session_id": session.session_id,
                        "stage": stage.name,
                        "reason": decision.reason,
                    })),
                );
                return Some(self.skip(
                    stage,
                    session,
                    format!("approval denied: {}", decision.reason),
                ));
            }
            debug!(stage = %stage.name, reason = %decision.reason, "Stage approved");
        }
        None
    }

    fn skip(&self, stage: &StageDefinition, session: &PipelineSession, reason: String) -> StageResult {
        info!(session_id = %session.session_id, stage = %stage.name, %reason, "Stage skipped");
        self.events.try_emit(
            names::STAGE_SKIPPED,
            Some(json!({
                "session_id": session.session_id,
                "stage": stage.name,
                "reason": reason,
            })),
        );
        StageResult::skipped(stage, reason)
    }

    async fn run_stage(&self, stage: &StageDefinition, session: &PipelineSession) -> StageResult {
        let session_id = session.session_id.as_str();
        self.set_in_progress(&stage.name, StageStatus::Running, 0);
        self.events
            .emit(
                names::STAGE_STARTED,
                Some(json!({
                    "session_id": session_id,
                    "stage": stage.name,
                    "agent_type": stage.agent_type,
                })),
            )
            .await;
        info!(session_id, stage = %stage.name, agent_type = %stage.agent_type, "Stage started");

        let timer = SpanTimer::start(format!("stage:{}", stage.name));
        let invocation = StageInvocation::for_stage(stage);
        let invocation = &invocation;
        let timeout_ms = stage.timeout_ms.or(self.config.stage_timeout_ms);

        let attempted = run_with_retry(
            &self.config.retry,
            self.sleeper.as_ref(),
            |retry, error: &String, delay| {
                self.set_in_progress(&stage.name, StageStatus::Retrying, retry);
                self.events.try_emit(
                    names::STAGE_RETRYING,
                    Some(json!({
                        "session_id": session_id,
                        "stage": stage.name,
                        "retry": retry,
                        "delay_ms": duration_ms(delay),
                        "error": error,
                    })),
                );
                warn!(session_id, stage = %stage.name, retry, error = %error, "Stage attempt failed, retrying");
            },
            move |attempt| async move {
                debug!(stage = %invocation.name, attempt, "Invoking agent");
                self.invoke(invocation, session, timeout_ms).await
            },
        )
        .await;

        let elapsed = timer.finish();
        self.clear_in_progress(&stage.name);

        match attempted.result {
            Ok(output) => {
                self.events.try_emit(
                    names::STAGE_COMPLETED,
                    Some(json!({
                        "session_id": session_id,
                        "stage": stage.name,
                        "duration_ms": elapsed,
                        "retry_count": attempted.retries,
                        "output_len": output.len(),
                    })),
                );
                info!(session_id, stage = %stage.name, duration_ms = elapsed, retries = attempted.retries, "Stage completed");
                StageResult::completed(stage, elapsed, attempted.retries)
            }
            Err(reason) => {
                let error = PipelineError::StageFailed {
                    stage: stage.name.clone(),
                    attempts: attempted.retries + 1,
                    reason: reason.clone(),
                };
                self.events.try_emit(
                    names::STAGE_FAILED,
                    Some(json!({
                        "session_id": session_id,
                        "stage": stage.name,
                        "kind": error.kind(),
                        "error": error.to_string(),
                        "duration_ms": elapsed,
                        "retry_count": attempted.retries,
                    })),
                );
                warn!(session_id, stage = %stage.name, error = %error, "Stage failed");
                StageResult::failed(stage, elapsed, attempted.retries, reason)
            }
        }
    }

    async fn invoke(
        &self,
        invocation: &StageInvocation,
        session: &PipelineSession,
        timeout_ms: Option<u64>,
    ) -> Result<String, String> {
        let call = self.executor.invoke_agent(invocation, session);
        let outcome = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(PipelineError::StageTimeout {
                        stage: invocation.name.clone(),
                        timeout_ms: ms,
                    }
                    .to_string())
                }
            },
            None => call.await,
        };
        outcome.map_err(|e| format!("{e:#}"))
    }

    async fn record(
        &self,
        session: &mut PipelineSession,
        result: StageResult,
    ) -> Result<(), OrchestratorError> {
        session.record(result);
        if let Some(live) = self.live.write().as_mut() {
            live.session = session.clone();
        }
        self.sessions.save(session).await?;
        Ok(())
    }

    /// Runs ad-hoc invocations outside the stage catalog.
    ///
    /// Every invocation runs, whatever happens to the others, and gets one
    /// attempt under the default stage timeout.
    pub async fn coordinate_agents(
        &self,
        session: &PipelineSession,
        invocations: &[StageInvocation],
        mode: CoordinationMode,
    ) -> Vec<AgentExecution> {
        debug!(
            session_id = %session.session_id,
            count = invocations.len(),
            ?mode,
            "Coordinating agents"
        );
        match mode {
            CoordinationMode::Sequential => {
                let mut executions = Vec::with_capacity(invocations.len());
                for invocation in invocations {
                    executions.push(self.invoke_once(invocation, session).await);
                }
                executions
            }
            CoordinationMode::Parallel => {
                join_all(
                    invocations
                        .iter()
                        .map(|invocation| self.invoke_once(invocation, session)),
                )
                .await
            }
        }
    }

    async fn invoke_once(&self, invocation: &StageInvocation, session: &PipelineSession) -> AgentExecution {
        let timer = SpanTimer::start(format!("agent:{}", invocation.name));
        let outcome = self
            .invoke(invocation, session, self.config.stage_timeout_ms)
            .await;
        let elapsed = timer.finish();

        let (status, output, error) = match outcome {
            Ok(output) => (StageStatus::Completed, Some(output), None),
            Err(error) => (StageStatus::Failed, None, Some(error)),
        };
        self.events.try_emit(
            names::AGENT_INVOKED,
            Some(json!({
                "session_id": session.session_id,
                "name": invocation.name,
                "agent_type": invocation.agent_type,
                "status": status,
                "duration_ms": elapsed,
            })),
        );
        AgentExecution {
            name: invocation.name.clone(),
            agent_type: invocation.agent_type.clone(),
            status,
            duration_ms: elapsed,
            output,
            error,
        }
    }

    /// Orders a dynamic set of work items with the configured weights.
    pub fn plan_work_items(
        &self,
        items: Vec<WorkItem>,
        edges: &[DependencyEdge],
    ) -> Result<GraphAnalysis, GraphError> {
        let graph = DependencyGraph::new(items, edges)?;
        Ok(graph.analyze(&self.config.score_weights))
    }

    /// Loads a persisted session.
    pub async fn load_prior_session(
        &self,
        session_id: &str,
        project_dir: &Path,
    ) -> Result<PipelineSession, OrchestratorError> {
        self.sessions.load_prior_session(session_id, project_dir).await
    }

    /// The most recently started session of a project.
    pub async fn find_latest_session(&self, project_dir: &Path) -> Result<Option<String>, OrchestratorError> {
        self.sessions.find_latest_session(project_dir).await
    }

    /// Status of the current or last session.
    #[must_use]
    pub fn get_status(&self) -> StatusReport {
        match self.live.read().as_ref() {
            Some(live) => StatusReport {
                session_id: Some(live.session.session_id.clone()),
                status: Some(live.session.status),
                stages: live.session.stage_results.clone(),
            },
            None => StatusReport::default(),
        }
    }

    /// Live progress of the current or last session.
    #[must_use]
    pub fn monitor_pipeline(&self) -> Option<MonitorSnapshot> {
        self.live.read().as_ref().map(LiveRun::snapshot)
    }

    /// True while a session is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    fn activate(&self, session_id: &str) -> Result<ActiveRun<'_>, PipelineError> {
        let mut slot = self.active.lock();
        if let Some(running) = slot.as_ref() {
            return Err(PipelineError::SessionAlreadyRunning {
                session_id: running.clone(),
            });
        }
        *slot = Some(session_id.to_string());
        Ok(ActiveRun { slot: &self.active })
    }

    fn begin_live(&self, session: &PipelineSession, catalog: &StageCatalog) {
        *self.live.write() = Some(LiveRun {
            session: session.clone(),
            stage_order: catalog.names().to_vec(),
            in_progress: HashMap::new(),
            started: Instant::now(),
            finished_ms: None,
        });
    }

    fn finish_live(&self, session: &PipelineSession, elapsed_ms: u64) {
        if let Some(live) = self.live.write().as_mut() {
            live.session = session.clone();
            live.in_progress.clear();
            live.finished_ms = Some(elapsed_ms);
        }
    }

    fn set_in_progress(&self, stage: &str, status: StageStatus, retries: u32) {
        if let Some(live) = self.live.write().as_mut() {
            live.in_progress.insert(stage.to_string(), (status, retries));
        }
    }

    fn clear_in_progress(&self, stage: &str) {
        if let Some(live) = self.live.write().as_mut() {
            live.in_progress.remove(stage);
        }
    }
}

fn validate_project_dir(path: &Path) -> Result<(), PipelineError> {
    let invalid = |reason: &str| PipelineError::InvalidProjectDir {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(invalid("not a directory")),
        Err(e) => Err(invalid(&e.to_string())),
    }
}

fn summarize(session: &PipelineSession) -> Vec<String> {
    let mut warnings = Vec::new();
    if session.status == SessionStatus::Partial {
        warnings.push(format!(
            "Pipeline partially completed: completed [{}]",
            session.stages_with(StageStatus::Completed).join(", ")
        ));
    }
    for result in &session.stage_results {
        let reason = result.error.as_deref().unwrap_or("unknown");
        match result.status {
            StageStatus::Failed => warnings.push(format!("Stage '{}' failed: {reason}", result.name)),
            StageStatus::Skipped => warnings.push(format!("Stage '{}' skipped: {reason}", result.name)),
            _ => {}
        }
    }
    warnings
}

fn result_of(session: &PipelineSession, duration_ms: u64, warnings: Vec<String>) -> PipelineResult {
    PipelineResult {
        pipeline_id: session.session_id.clone(),
        mode: session.mode,
        overall_status: session.status,
        stages: session.stage_results.clone(),
        duration_ms,
        warnings,
        resumed_from: session.resumed_from.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{ApprovalMode, ManualApproval};
    use crate::testing::{NoDelay, ScriptedExecutor, TestProject};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn orchestrator(project: &TestProject, executor: Arc<dyn StageExecutor>) -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default(), project.store(), executor)
            .with_sleeper(Arc::new(NoDelay))
    }

    #[tokio::test]
    async fn test_greenfield_all_complete() {
        let project = TestProject::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let sink = Arc::new(CollectingEventSink::new());
        let orch = orchestrator(&project, executor.clone()).with_event_sink(sink.clone());

        let result = orch
            .execute_pipeline(project.request("greenfield"))
            .await
            .unwrap();

        assert_eq!(result.overall_status, SessionStatus::Completed);
        assert_eq!(result.stages.len(), 6);
        assert!(result.warnings.is_empty());
        assert_eq!(executor.calls().len(), 6);
        assert_eq!(sink.names().first().map(String::as_str), Some(names::PIPELINE_STARTED));
        assert_eq!(sink.names().last().map(String::as_str), Some(names::PIPELINE_COMPLETED));
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_unknown_mode_rejected_before_running() {
        let project = TestProject::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let orch = orchestrator(&project, executor.clone());

        let err = orch
            .execute_pipeline(project.request("brownfield"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "unsupported_mode");
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_mode_rejected() {
        let project = TestProject::new().unwrap();
        let orch = orchestrator(&project, Arc::new(ScriptedExecutor::new()));

        let request = SessionRequest::new(project.path(), "anything");
        let err = orch.start_session(request).await.unwrap_err();
        assert_eq!(err.kind(), "unsupported_mode");
    }

    #[tokio::test]
    async fn test_missing_project_dir_rejected() {
        let project = TestProject::new().unwrap();
        let orch = orchestrator(&project, Arc::new(ScriptedExecutor::new()));

        let request = SessionRequest::new(project.path().join("missing"), "x").with_mode("import");
        let err = orch.start_session(request).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_project_dir");
    }

    #[tokio::test]
    async fn test_manual_mode_without_policy_rejected() {
        let project = TestProject::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let config = OrchestratorConfig::default().with_approval_mode(ApprovalMode::Manual);
        let orch = Orchestrator::new(config, project.store(), executor.clone());

        let err = orch
            .execute_pipeline(project.request("import"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "missing_approval_policy");
        assert_eq!(err.to_dict().get("mode").unwrap(), "manual");
        assert!(executor.calls().is_empty());
        assert!(project.session_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_mode_answered_by_host() {
        let project = TestProject::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let (manual, mut requests) = ManualApproval::with_channel(Duration::from_secs(5));
        let manual = Arc::new(manual);
        let config = OrchestratorConfig::default().with_approval_mode(ApprovalMode::Manual);
        let orch = Orchestrator::new(config, project.store(), executor.clone())
            .with_sleeper(Arc::new(NoDelay))
            .with_approval_policy(manual.clone());

        let answerer = {
            let manual = Arc::clone(&manual);
            tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    assert!(manual.approve(request.id));
                }
            })
        };

        let result = orch
            .execute_pipeline(project.request("import"))
            .await
            .unwrap();
        assert_eq!(result.overall_status, SessionStatus::Completed);
        assert_eq!(manual.pending_count(), 0);
        answerer.abort();
    }

    #[tokio::test]
    async fn test_second_session_rejected_while_running() {
        let project = TestProject::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().with_delay("codebase-analysis", Duration::from_millis(200)));
        let orch = Arc::new(orchestrator(&project, executor));

        let running = {
            let orch = Arc::clone(&orch);
            let request = project.request("enhancement");
            tokio::spawn(async move { orch.execute_pipeline(request).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(orch.is_running());
        let err = orch
            .start_session(project.request("import"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_already_running");

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.overall_status, SessionStatus::Completed);
        assert!(orch.start_session(project.request("import")).await.is_ok());
    }

    #[tokio::test]
    async fn test_monitor_reports_running_stage() {
        let project = TestProject::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().with_delay("issue-triage", Duration::from_millis(200)));
        let orch = Arc::new(orchestrator(&project, executor));
        assert!(orch.monitor_pipeline().is_none());
        assert_eq!(orch.get_status(), StatusReport::default());

        let running = {
            let orch = Arc::clone(&orch);
            let request = project.request("import");
            tokio::spawn(async move { orch.execute_pipeline(request).await })
        };
        tokio::time::sleep(Duration::from_millis(80)).await;

        let snapshot = orch.monitor_pipeline().unwrap();
        assert_eq!(snapshot.status, SessionStatus::Running);
        assert_eq!(snapshot.current_stage.as_deref(), Some("issue-triage"));
        assert_eq!(snapshot.completed_stages, 1);
        assert_eq!(snapshot.total_stages, 4);
        assert_eq!(snapshot.stages[2].status, StageStatus::Pending);

        running.await.unwrap().unwrap();
        let finished = orch.monitor_pipeline().unwrap();
        assert_eq!(finished.status, SessionStatus::Completed);
        assert_eq!(finished.current_stage, None);
        assert_eq!(orch.get_status().stages.len(), 4);
    }

    #[tokio::test]
    async fn test_stage_timeout_counts_as_failed_attempt() {
        let project = TestProject::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().with_delay("issue-import", Duration::from_millis(500)));
        let config = OrchestratorConfig::default()
            .with_max_retries(1)
            .with_stage_timeout_ms(Some(20));
        let orch = Orchestrator::new(config, project.store(), executor.clone())
            .with_sleeper(Arc::new(NoDelay));

        let err = orch
            .execute_pipeline(project.request("import"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "pipeline_failed");
        assert_eq!(executor.attempts("issue-import"), 2);
        let status = orch.get_status();
        assert_eq!(status.status, Some(SessionStatus::Failed));
        assert!(status.stages[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_coordinate_agents_sequential_and_parallel() {
        let project = TestProject::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().always_fail("lint#1"));
        let sink = Arc::new(CollectingEventSink::new());
        let orch = orchestrator(&project, executor.clone()).with_event_sink(sink.clone());
        let session = PipelineSession::new(project.path(), "fan out", PipelineMode::Enhancement);

        let invocations = vec![
            StageInvocation::new("lint#0", "linter").with_inputs(json!({"file": "a.rs"})),
            StageInvocation::new("lint#1", "linter").with_inputs(json!({"file": "b.rs"})),
            StageInvocation::new("lint#2", "linter").with_inputs(json!({"file": "c.rs"})),
        ];

        let sequential = orch
            .coordinate_agents(&session, &invocations, CoordinationMode::Sequential)
            .await;
        let statuses: Vec<_> = sequential.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![StageStatus::Completed, StageStatus::Failed, StageStatus::Completed]
        );
        assert_eq!(executor.calls(), vec!["lint#0", "lint#1", "lint#2"]);

        let parallel = orch
            .coordinate_agents(&session, &invocations, CoordinationMode::Parallel)
            .await;
        assert_eq!(parallel.len(), 3);
        assert_eq!(parallel.iter().filter(|e| e.succeeded()).count(), 2);
        assert!(parallel[1].error.is_some());
        assert_eq!(sink.events_of_type(names::AGENT_INVOKED).len(), 6);
    }

    #[test]
    fn test_plan_work_items_uses_config_weights() {
        let project = TestProject::new().unwrap();
        let orch = orchestrator(&project, Arc::new(ScriptedExecutor::new()));
        let items = vec![
            WorkItem::new("schema"),
            WorkItem::new("api").depends_on("schema"),
            WorkItem::new("ui").depends_on("api"),
        ];

        let analysis = orch.plan_work_items(items, &[]).unwrap();
        assert_eq!(analysis.total_items, 3);
        assert_eq!(analysis.critical_path.items, vec!["schema", "api", "ui"]);
    }
}
