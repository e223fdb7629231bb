//! Executor doubles for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::pipeline::{PipelineSession, StageExecutor, StageInvocation};

#[derive(Debug, Clone, Copy)]
enum Failure {
    Times(u32),
    Always,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An executor whose behavior is scripted per invocation name.
///
/// Unscripted invocations succeed immediately with `"<agent_type> output"`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    failures: HashMap<String, Failure>,
    delays: HashMap<String, Duration>,
    outputs: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    /// Creates an executor where everything succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `times` attempts of `name`, then succeeds.
    #[must_use]
    pub fn fail_times(mut self, name: impl Into<String>, times: u32) -> Self {
        self.failures.insert(name.into(), Failure::Times(times));
        self
    }

    /// Fails every attempt of `name`.
    #[must_use]
    pub fn always_fail(mut self, name: impl Into<String>) -> Self {
        self.failures.insert(name.into(), Failure::Always);
        self
    }

    /// Delays every attempt of `name`.
    #[must_use]
    pub fn with_delay(mut self, name: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(name.into(), delay);
        self
    }

    /// Sets the output returned by `name`.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, output: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), output.into());
        self
    }

    /// Invocation names in call order, one entry per attempt.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Invocation names in the order their attempts finished.
    #[must_use]
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }

    /// Attempts made for `name`.
    #[must_use]
    pub fn attempts(&self, name: &str) -> u32 {
        self.attempts.lock().get(name).copied().unwrap_or(0)
    }

    /// Highest number of invocations observed running at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Forgets recorded calls; the script is kept.
    pub fn reset(&self) {
        self.calls.lock().clear();
        self.finished.lock().clear();
        self.attempts.lock().clear();
        self.peak.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn invoke_agent(
        &self,
        invocation: &StageInvocation,
        _session: &PipelineSession,
    ) -> anyhow::Result<String> {
        let name = invocation.name.as_str();
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.calls.lock().push(name.to_string());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(delay) = self.delays.get(name) {
            tokio::time::sleep(*delay).await;
        }
        self.finished.lock().push(name.to_string());

        match self.failures.get(name) {
            Some(Failure::Always) => anyhow::bail!("{name} failed on attempt {attempt}"),
            Some(Failure::Times(times)) if attempt <= *times => {
                anyhow::bail!("{name} failed on attempt {attempt}")
            }
            _ => Ok(self
                .outputs
                .get(name)
                .cloned()
                .unwrap_or_else(|| format!("{} output", invocation.agent_type))),
        }
    }
}

/// An executor that succeeds and remembers every invocation with its session.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    invocations: Mutex<Vec<(String, StageInvocation)>>,
}

impl RecordingExecutor {
    /// Creates a recording executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(session_id, invocation)` pairs.
    #[must_use]
    pub fn invocations(&self) -> Vec<(String, StageInvocation)> {
        self.invocations.lock().clone()
    }

    /// Recorded invocation names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.invocations
            .lock()
            .iter()
            .map(|(_, invocation)| invocation.name.clone())
            .collect()
    }
}

#[async_trait]
impl StageExecutor for RecordingExecutor {
    async fn invoke_agent(
        &self,
        invocation: &StageInvocation,
        session: &PipelineSession,
    ) -> anyhow::Result<String> {
        self.invocations
            .lock()
            .push((session.session_id.clone(), invocation.clone()));
        Ok(format!("{} done", invocation.agent_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineMode;

    fn session() -> PipelineSession {
        PipelineSession::new("/tmp", "test", PipelineMode::Import)
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let executor = ScriptedExecutor::new().fail_times("a", 2);
        let invocation = StageInvocation::new("a", "agent");

        assert!(executor.invoke_agent(&invocation, &session()).await.is_err());
        assert!(executor.invoke_agent(&invocation, &session()).await.is_err());
        let output = executor.invoke_agent(&invocation, &session()).await.unwrap();

        assert_eq!(output, "agent output");
        assert_eq!(executor.attempts("a"), 3);
        assert_eq!(executor.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_recording_executor_keeps_session_ids() {
        let executor = RecordingExecutor::new();
        let session = session();
        executor
            .invoke_agent(&StageInvocation::new("x", "agent"), &session)
            .await
            .unwrap();

        let recorded = executor.invocations();
        assert_eq!(recorded[0].0, session.session_id);
        assert_eq!(executor.names(), vec!["x"]);
    }
}
