//! Execution runner seam.
//!
//! The runner performs the actual reindex and reports a [`TaskOutcome`]. The
//! engine never interrupts a run; the watchdog only does bookkeeping.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use crate::jobs::evidence::EvidenceDiff;
use crate::jobs::retry_queue::QueueId;
use crate::jobs::task::{ReindexScope, TaskId, TaskOutcome};
use crate::observability::trace::TraceLink;

/// Everything a runner needs to perform one reindex.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_id: TaskId,
    pub scope: ReindexScope,
    /// 0 for a first run, otherwise the queue entry's attempt count
    pub attempt: u32,
    pub retry_of: Option<QueueId>,
    pub trace: Option<TraceLink>,
}

/// Performs reindex work for a scope.
#[async_trait]
pub trait ExecutionRunner: Send + Sync {
    /// Runner name for logs.
    fn name(&self) -> &'static str;

    async fn run(&self, request: RunRequest) -> TaskOutcome;
}

/// Reports an empty success for every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRunner;

#[async_trait]
impl ExecutionRunner for NoopRunner {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn run(&self, _request: RunRequest) -> TaskOutcome {
        TaskOutcome::success(EvidenceDiff::default())
    }
}

/// Replays canned outcomes in order, then falls back to a default.
///
/// Useful for tests and demos where the sequence of successes and failures
/// must be controlled.
#[derive(Debug)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<TaskOutcome>>,
    fallback: TaskOutcome,
    delay: Duration,
    calls: Mutex<Vec<RunRequest>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ScriptedRunner {
    pub fn new(outcomes: impl IntoIterator<Item = TaskOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            fallback: TaskOutcome::success(EvidenceDiff::default()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Outcome used once the script is exhausted.
    pub fn with_fallback(mut self, outcome: TaskOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Simulated execution time per run.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, outcome: TaskOutcome) {
        self.script.lock().push_back(outcome);
    }

    /// Requests received so far.
    pub fn calls(&self) -> Vec<RunRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ExecutionRunner for ScriptedRunner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, request: RunRequest) -> TaskOutcome {
        self.calls.lock().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RunRequest {
        RunRequest {
            task_id: TaskId::new(),
            scope: ReindexScope::All,
            attempt: 0,
            retry_of: None,
            trace: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_runner_replays_then_falls_back() {
        let runner = ScriptedRunner::new([TaskOutcome::failure("EMBEDDING_TIMEOUT")])
            .with_fallback(TaskOutcome::failure("QUOTA"));

        assert_eq!(runner.run(request()).await, TaskOutcome::failure("EMBEDDING_TIMEOUT"));
        assert_eq!(runner.run(request()).await, TaskOutcome::failure("QUOTA"));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_noop_runner_succeeds() {
        let outcome = NoopRunner.run(request()).await;
        assert_eq!(outcome.status(), crate::jobs::task::TaskStatus::Completed);
    }
}
