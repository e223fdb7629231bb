//! Pipeline sessions, stage results and their persisted records.

use super::catalog::StageDefinition;
use crate::core::{PipelineMode, SessionStatus, StageStatus};
use crate::errors::{OrchestratorError, PipelineError, StoreError};
use crate::store::StateStore;
use crate::utils::{generate_session_id, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// The recorded outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    /// Stage name.
    pub name: String,
    /// Agent type the stage was run with.
    pub agent_type: String,
    /// Terminal status: completed, failed or skipped.
    pub status: StageStatus,
    /// Wall-clock time across all attempts.
    #[serde(default)]
    pub duration_ms: u64,
    /// Retries performed after the first attempt.
    #[serde(default)]
    pub retry_count: u32,
    /// Last error, or the skip reason.
    #[serde(default)]
    pub error: Option<String>,
}

impl StageResult {
    /// A completed stage.
    #[must_use]
    pub fn completed(stage: &StageDefinition, duration_ms: u64, retry_count: u32) -> Self {
        Self {
            name: stage.name.clone(),
            agent_type: stage.agent_type.clone(),
            status: StageStatus::Completed,
            duration_ms,
            retry_count,
            error: None,
        }
    }

    /// A stage that exhausted its retries.
    #[must_use]
    pub fn failed(
        stage: &StageDefinition,
        duration_ms: u64,
        retry_count: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            name: stage.name.clone(),
            agent_type: stage.agent_type.clone(),
            status: StageStatus::Failed,
            duration_ms,
            retry_count,
            error: Some(error.into()),
        }
    }

    /// A stage that never ran.
    #[must_use]
    pub fn skipped(stage: &StageDefinition, reason: impl Into<String>) -> Self {
        Self {
            name: stage.name.clone(),
            agent_type: stage.agent_type.clone(),
            status: StageStatus::Skipped,
            duration_ms: 0,
            retry_count: 0,
            error: Some(reason.into()),
        }
    }
}

/// One orchestrated run.
///
/// Persisted as camelCase JSON; `sessionId` is stored as `pipelineId`,
/// `status` as `overallStatus` and `stageResults` as `stages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSession {
    /// Session identity, stable for the life of the run.
    #[serde(rename = "pipelineId")]
    pub session_id: String,
    /// Project the run operates on.
    pub project_dir: PathBuf,
    /// The request that started the run.
    #[serde(default)]
    pub user_request: String,
    /// Pipeline mode; selects the stage catalog.
    pub mode: PipelineMode,
    /// Overall status.
    #[serde(rename = "overallStatus")]
    pub status: SessionStatus,
    /// Stage results, in catalog order once the run finishes.
    #[serde(rename = "stages", default)]
    pub stage_results: Vec<StageResult>,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the run reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    /// The session this one resumed.
    #[serde(default)]
    pub resumed_from: Option<String>,
    /// Stages carried over as completed from the resumed session.
    #[serde(default)]
    pub pre_completed_stages: Vec<String>,
}

impl PipelineSession {
    /// Creates a pending session with a fresh id.
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, user_request: impl Into<String>, mode: PipelineMode) -> Self {
        Self {
            session_id: generate_session_id(),
            project_dir: project_dir.into(),
            user_request: user_request.into(),
            mode,
            status: SessionStatus::Pending,
            stage_results: Vec::new(),
            started_at: now_utc(),
            completed_at: None,
            resumed_from: None,
            pre_completed_stages: Vec::new(),
        }
    }

    /// The recorded result for a stage.
    #[must_use]
    pub fn result_for(&self, stage: &str) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.name == stage)
    }

    /// Records a result, replacing any earlier result for the same stage.
    pub fn record(&mut self, result: StageResult) {
        match self.stage_results.iter_mut().find(|r| r.name == result.name) {
            Some(existing) => *existing = result,
            None => self.stage_results.push(result),
        }
    }

    /// Names of stages with the given status.
    #[must_use]
    pub fn stages_with(&self, status: StageStatus) -> Vec<String> {
        self.stage_results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.name.clone())
            .collect()
    }

    /// True once the session has reached a terminal status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionHeader {
    pipeline_id: String,
    started_at: Timestamp,
}

/// Reads and writes session records through the state store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    store: Arc<StateStore>,
    state_dir_name: String,
    durable: bool,
}

impl SessionStore {
    /// Creates a session store.
    ///
    /// With `durable` set, every checkpoint bypasses the write batcher.
    #[must_use]
    pub fn new(store: Arc<StateStore>, state_dir_name: impl Into<String>, durable: bool) -> Self {
        Self {
            store,
            state_dir_name: state_dir_name.into(),
            durable,
        }
    }

    /// Directory holding a project's session records.
    #[must_use]
    pub fn session_dir(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.state_dir_name).join("sessions")
    }

    /// Location of one session record.
    #[must_use]
    pub fn session_path(&self, project_dir: &Path, session_id: &str) -> PathBuf {
        self.session_dir(project_dir).join(format!("{session_id}.json"))
    }

    /// Persists the full session.
    pub async fn save(&self, session: &PipelineSession) -> Result<(), StoreError> {
        let path = self.session_path(&session.project_dir, &session.session_id);
        debug!(
            session_id = %session.session_id,
            status = %session.status,
            stages = session.stage_results.len(),
            "Checkpointing session"
        );
        if self.durable {
            self.store.write_json_immediate(&path, session).await
        } else {
            self.store.write_json(&path, session).await
        }
    }

    /// Flushes batched checkpoints.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.store.flush().await.map(|_| ())
    }

    /// Loads a persisted session.
    ///
    /// Fails with `SessionNotFound` if there is no record and with
    /// `CorruptedSession` if the record is unparseable or has no mode.
    pub async fn load_prior_session(
        &self,
        session_id: &str,
        project_dir: &Path,
    ) -> Result<PipelineSession, OrchestratorError> {
        let path = self.session_path(project_dir, session_id);
        let corrupted = |reason: String| PipelineError::CorruptedSession {
            session_id: session_id.to_string(),
            path: path.clone(),
            reason,
        };

        if session_id.is_empty() || session_id.contains(['/', '\\']) || session_id.contains("..") {
            return Err(PipelineError::SessionNotFound {
                session_id: session_id.to_string(),
                path,
            }
            .into());
        }

        let Some(bytes) = self.store.read_bytes(&path).await? else {
            return Err(PipelineError::SessionNotFound {
                session_id: session_id.to_string(),
                path,
            }
            .into());
        };

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| corrupted(format!("payload is not valid JSON: {e}")))?;
        match value.get("mode") {
            None | Some(Value::Null) => return Err(corrupted("missing mode field".into()).into()),
            Some(_) => {}
        }
        let session: PipelineSession = serde_json::from_value(value)
            .map_err(|e| corrupted(format!("payload does not describe a session: {e}")))?;

        if session.session_id != session_id {
            return Err(corrupted(format!(
                "record belongs to session '{}'",
                session.session_id
            ))
            .into());
        }
        Ok(session)
    }

    /// The most recently started session of a project, if any.
    ///
    /// Unreadable records are skipped.
    pub async fn find_latest_session(
        &self,
        project_dir: &Path,
    ) -> Result<Option<String>, OrchestratorError> {
        let dir = self.session_dir(project_dir);
        let mut latest: Option<SessionHeader> = None;

        for path in self.store.list(&dir, Some("json")).await? {
            let Some(bytes) = self.store.read_bytes(&path).await? else {
                continue;
            };
            let header: SessionHeader = match serde_json::from_slice(&bytes) {
                Ok(header) => header,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable session record");
                    continue;
                }
            };
            if latest
                .as_ref()
                .map_or(true, |current| header.started_at > current.started_at)
            {
                latest = Some(header);
            }
        }

        Ok(latest.map(|header| header.pipeline_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn session_store(durable: bool) -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(StoreConfig::new(dir.path())));
        (dir, SessionStore::new(store, ".conductor", durable))
    }

    fn sample_session(project: &Path) -> PipelineSession {
        let stage = StageDefinition::new("requirements", "requirements-analyst");
        let mut session = PipelineSession::new(project, "build a todo app", PipelineMode::Greenfield);
        session.status = SessionStatus::Partial;
        session.record(StageResult::completed(&stage, 1200, 1));
        session.record(StageResult::failed(
            &StageDefinition::new("architecture", "architect"),
            300,
            3,
            "agent crashed",
        ));
        session
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (dir, sessions) = session_store(true);
        let session = sample_session(dir.path());

        sessions.save(&session).await.unwrap();
        let loaded = sessions
            .load_prior_session(&session.session_id, dir.path())
            .await
            .unwrap();

        assert_eq!(loaded, session);
        assert!(sessions
            .session_path(dir.path(), &session.session_id)
            .exists());
    }

    #[tokio::test]
    async fn test_batched_checkpoint_visible_before_flush() {
        let (dir, sessions) = session_store(false);
        let session = sample_session(dir.path());

        sessions.save(&session).await.unwrap();
        let loaded = sessions
            .load_prior_session(&session.session_id, dir.path())
            .await
            .unwrap();
        assert_eq!(loaded.stage_results.len(), 2);

        sessions.flush().await.unwrap();
        assert!(sessions
            .session_path(dir.path(), &session.session_id)
            .exists());
    }

    #[test]
    fn test_record_wire_names() {
        let session = sample_session(Path::new("/tmp/project"));
        let value = serde_json::to_value(&session).unwrap();

        assert_eq!(value["pipelineId"], session.session_id.as_str());
        assert_eq!(value["overallStatus"], "partial");
        assert_eq!(value["stages"][0]["agentType"], "requirements-analyst");
        assert_eq!(value["stages"][1]["retryCount"], 3);
        assert_eq!(value["mode"], "greenfield");
    }

    #[test]
    fn test_record_replaces_existing_result() {
        let stage = StageDefinition::new("a", "agent");
        let mut session = PipelineSession::new("/tmp", "", PipelineMode::Import);
        session.record(StageResult::failed(&stage, 5, 0, "boom"));
        session.record(StageResult::completed(&stage, 7, 1));

        assert_eq!(session.stage_results.len(), 1);
        assert_eq!(session.stages_with(StageStatus::Completed), vec!["a"]);
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let (dir, sessions) = session_store(true);
        let err = sessions
            .load_prior_session("nope", dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_not_found");
    }

    #[tokio::test]
    async fn test_path_like_session_id_is_not_found() {
        let (dir, sessions) = session_store(true);
        let err = sessions
            .load_prior_session("../escape", dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_not_found");
    }

    #[tokio::test]
    async fn test_missing_mode_is_corrupted() {
        let (dir, sessions) = session_store(true);
        let session = sample_session(dir.path());
        let mut value = serde_json::to_value(&session).unwrap();
        value.as_object_mut().unwrap().remove("mode");
        let path = sessions.session_path(dir.path(), &session.session_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        let err = sessions
            .load_prior_session(&session.session_id, dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "corrupted_session");
        assert!(err.to_string().contains("missing mode field"));
    }

    #[tokio::test]
    async fn test_unparseable_payload_is_corrupted() {
        let (dir, sessions) = session_store(true);
        let path = sessions.session_path(dir.path(), "broken");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{\"pipelineId\": \"broken\", ").unwrap();

        let err = sessions
            .load_prior_session("broken", dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "corrupted_session");
    }

    #[tokio::test]
    async fn test_unknown_mode_is_corrupted() {
        let (dir, sessions) = session_store(true);
        let session = sample_session(dir.path());
        let mut value = serde_json::to_value(&session).unwrap();
        value["mode"] = Value::from("brownfield");
        let path = sessions.session_path(dir.path(), &session.session_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        let err = sessions
            .load_prior_session(&session.session_id, dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "corrupted_session");
    }

    #[tokio::test]
    async fn test_find_latest_session_orders_by_start_time() {
        let (dir, sessions) = session_store(true);
        assert_eq!(sessions.find_latest_session(dir.path()).await.unwrap(), None);

        let mut older = sample_session(dir.path());
        older.started_at = now_utc() - ChronoDuration::hours(2);
        let mut newer = sample_session(dir.path());
        newer.started_at = now_utc() - ChronoDuration::minutes(5);
        let mut middle = sample_session(dir.path());
        middle.started_at = now_utc() - ChronoDuration::hours(1);

        for session in [&older, &newer, &middle] {
            sessions.save(session).await.unwrap();
        }
        std::fs::write(sessions.session_dir(dir.path()).join("junk.json"), b"not json").unwrap();

        let latest = sessions.find_latest_session(dir.path()).await.unwrap();
        assert_eq!(latest, Some(newer.session_id));
    }
}
