//! Reindex engine.
//!
//! Ties the job registry, retry queue, runner, and audit log together.
//! `submit` and `retry` return as soon as state is created or claimed; the
//! runner executes on its own tokio task and reports back through
//! [`ReindexEngine::record_outcome`].

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::audit::{AuditExport, AuditLog};
use crate::config::Config;
use crate::error::{ErrorCode, ReindexError, Result};
use crate::jobs::clock::{Clock, SystemClock};
use crate::jobs::cooldown::CooldownPolicy;
use crate::jobs::evidence::EvidenceTracker;
use crate::jobs::history::{HistoryFilter, TaskHistory};
use crate::jobs::registry::{JobRegistry, SubmitRequest, Transition};
use crate::jobs::retry_queue::{
    QueueEntry, QueueEntryView, QueueFilter, QueueId, QueueMutation, RetryMode, RetryQueue,
};
use crate::jobs::runner::{ExecutionRunner, RunRequest};
use crate::jobs::task::{ReindexScope, ReindexTask, TaskId, TaskOutcome, TaskStatus};
use crate::observability::metrics;
use crate::observability::trace::TraceLinker;

/// Actor recorded for retries started by the scheduler.
pub const SCHEDULER_ACTOR: &str = "scheduler";

// ═══════════════════════════════════════════════════════════════════════════════
// Commands
// ═══════════════════════════════════════════════════════════════════════════════

/// A request to reindex a scope.
#[derive(Debug, Clone)]
pub struct SubmitCommand {
    pub scope: ReindexScope,
    pub actor: String,
    pub note: Option<String>,
    /// Caller-supplied trace id, used instead of the current span
    pub trace_id: Option<String>,
}

impl SubmitCommand {
    pub fn new(scope: ReindexScope, actor: impl Into<String>) -> Self {
        Self {
            scope,
            actor: actor.into(),
            note: None,
            trace_id: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// A request to retry a queue entry.
#[derive(Debug, Clone)]
pub struct RetryCommand {
    pub actor: String,
    pub note: Option<String>,
    /// Retry even when cooling down or auto-exhausted
    pub force: bool,
}

impl RetryCommand {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            note: None,
            force: false,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// What one scheduler pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub cooldowns_cleared: usize,
    pub timed_out: Vec<TaskId>,
    pub retried: Vec<QueueId>,
    pub skipped: Vec<QueueId>,
}

/// Point-in-time counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_tasks: usize,
    pub running_tasks: usize,
    pub queue_depth: usize,
    pub audit_records: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`ReindexEngine`].
pub struct EngineBuilder {
    runner: Arc<dyn ExecutionRunner>,
    policy: CooldownPolicy,
    max_attempts: u32,
    execution_timeout: Duration,
    evidence: EvidenceTracker,
    linker: TraceLinker,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn new(runner: Arc<dyn ExecutionRunner>) -> Self {
        Self::from_config(runner, &Config::default())
    }

    pub fn from_config(runner: Arc<dyn ExecutionRunner>, config: &Config) -> Self {
        Self {
            runner,
            policy: CooldownPolicy::from_config(&config.retry),
            max_attempts: config.retry.max_attempts,
            execution_timeout: config.execution.timeout,
            evidence: EvidenceTracker::new(config.evidence.sample_cap),
            linker: TraceLinker::new(config.observability.trace_url_template.clone()),
            audit: Arc::new(AuditLog::in_memory(config.audit.max_in_memory)),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_policy(mut self, policy: CooldownPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_trace_linker(mut self, linker: TraceLinker) -> Self {
        self.linker = linker;
        self
    }

    pub fn build(self) -> Arc<ReindexEngine> {
        Arc::new(ReindexEngine {
            registry: JobRegistry::new(),
            queue: RetryQueue::new(self.policy, self.max_attempts),
            runner: self.runner,
            execution_timeout: self.execution_timeout,
            evidence: self.evidence,
            linker: self.linker,
            audit: self.audit,
            clock: self.clock,
        })
    }
}

/// The retryable reindex job engine.
pub struct ReindexEngine {
    registry: JobRegistry,
    queue: RetryQueue,
    runner: Arc<dyn ExecutionRunner>,
    execution_timeout: Duration,
    evidence: EvidenceTracker,
    linker: TraceLinker,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ReindexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReindexEngine")
            .field("runner", &self.runner.name())
            .field("tasks", &self.registry.len())
            .field("queue_depth", &self.queue.len())
            .field("execution_timeout", &self.execution_timeout)
            .finish()
    }
}

impl ReindexEngine {
    pub fn builder(runner: Arc<dyn ExecutionRunner>) -> EngineBuilder {
        EngineBuilder::new(runner)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission and Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a task for the scope and hand it to the runner.
    ///
    /// Returns once the task is running; the outcome arrives asynchronously.
    pub fn submit(self: &Arc<Self>, command: SubmitCommand) -> Result<ReindexTask> {
        let trace = self.linker.link(command.trace_id.as_deref());
        let request = SubmitRequest::new(command.scope, command.actor)
            .with_note(command.note)
            .with_trace(trace);

        let created = self.registry.submit(request, self.clock.now())?;
        self.audit_transition(&created);
        metrics::record_task_submitted(false);

        self.dispatch(created.task, 0)
    }

    fn dispatch(self: &Arc<Self>, task: ReindexTask, attempt: u32) -> Result<ReindexTask> {
        let running = self
            .registry
            .mark_running(task.task_id, task.trace.clone(), self.clock.now())?;
        self.audit_transition(&running);
        metrics::set_running_tasks(self.registry.count_by_status(TaskStatus::Running));

        let task = running.task;
        let request = RunRequest {
            task_id: task.task_id,
            scope: task.scope.clone(),
            attempt,
            retry_of: task.retry_of,
            trace: task.trace.clone(),
        };
        let span = tracing::info_span!(
            "reindex.run",
            task_id = %task.task_id,
            scope = %task.scope,
            attempt = attempt,
            runner = self.runner.name(),
        );

        let engine = Arc::clone(self);
        tokio::spawn(
            async move {
                let task_id = request.task_id;
                let outcome = engine.runner.run(request).await;
                match engine.record_outcome(task_id, outcome) {
                    Ok(_) => {}
                    Err(e) if e.code() == ErrorCode::OutcomeAlreadyRecorded => {
                        tracing::warn!(task_id = %task_id, "Runner reported after the task was already finished");
                    }
                    Err(e) => e.log(),
                }
            }
            .instrument(span),
        );

        Ok(task)
    }

    /// Apply a runner outcome and route failures into the retry queue.
    ///
    /// Every failure produces exactly one queue mutation (created or updated).
    /// Success of a retry resolves its queue entry.
    pub fn record_outcome(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<ReindexTask> {
        let outcome = match outcome {
            TaskOutcome::Success { evidence } => TaskOutcome::success(self.evidence.track(evidence)),
            TaskOutcome::Partial { evidence } => TaskOutcome::partial(self.evidence.track(evidence)),
            failure => failure,
        };

        let now = self.clock.now();
        let trace = self.linker.link(None);
        let finished = self.registry.record_outcome(task_id, outcome, None, trace, now)?;
        self.audit_transition(&finished);
        metrics::record_task_finished(finished.task.status, finished.task.duration_ms);

        let task = finished.task;
        match task.status {
            TaskStatus::Failed => {
                let mutation = self.route_failure(&task, now)?;
                self.audit.record_queue(&mutation);
            }
            TaskStatus::Completed | TaskStatus::Partial => {
                if let Some(queue_id) = task.retry_of {
                    if let Some(mutation) = self.queue.resolve(queue_id, now) {
                        self.audit.record_queue(&mutation);
                    }
                }
            }
            _ => {}
        }

        metrics::set_queue_depth(self.queue.len());
        metrics::set_running_tasks(self.registry.count_by_status(TaskStatus::Running));
        Ok(task)
    }

    fn route_failure(&self, task: &ReindexTask, now: chrono::DateTime<chrono::Utc>) -> Result<QueueMutation> {
        if let Some(queue_id) = task.retry_of {
            match self.queue.record_retry_failure(queue_id, task, now) {
                Ok(mutation) => return Ok(mutation),
                // Entry was dismissed while the retry ran; start over
                Err(e) if e.code() == ErrorCode::QueueEntryNotFound => {}
                Err(e) => return Err(e),
            }
        }
        self.queue.enqueue(task, RetryMode::Auto, now)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Retry Queue Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Retry a queue entry by resubmitting its scope as a new task.
    ///
    /// Fails with `NotEligible` when the entry is cooling down, exhausted or
    /// already running, unless forced (running entries are never forced).
    pub fn retry(self: &Arc<Self>, queue_id: QueueId, command: RetryCommand) -> Result<QueueEntry> {
        let now = self.clock.now();
        let claim = self
            .queue
            .claim(queue_id, &command.actor, command.note.as_deref(), command.force, now)?;
        for mutation in &claim.mutations {
            self.audit.record_queue(mutation);
        }

        let entry = claim.entry.clone();
        let request = SubmitRequest::new(entry.scope.clone(), command.actor.clone())
            .with_note(command.note.clone())
            .with_trace(self.linker.link(None))
            .with_retry_of(queue_id);

        let created = match self.registry.submit(request, now) {
            Ok(created) => created,
            Err(e) => {
                if let Some(mutation) = self.queue.release(claim, now) {
                    self.audit.record_queue(&mutation);
                }
                return Err(e);
            }
        };
        self.audit_transition(&created);
        metrics::record_task_submitted(true);
        metrics::record_retry(entry.retry_mode);

        let task_id = created.task.task_id;
        // The entry may be removed concurrently; the retry still runs
        let _ = self.queue.attach_task(queue_id, task_id);
        self.dispatch(created.task, entry.attempts)?;

        tracing::info!(
            queue_id = %queue_id,
            task_id = %task_id,
            attempts = entry.attempts,
            actor = %command.actor,
            "Retry dispatched"
        );

        Ok(QueueEntry {
            current_task_id: Some(task_id),
            ..entry
        })
    }

    /// Dismiss a queue entry. Task history is untouched.
    pub fn remove(&self, queue_id: QueueId, actor: Option<&str>) -> Result<()> {
        let mutation = self.queue.remove(queue_id, actor, self.clock.now())?;
        self.audit.record_queue(&mutation);
        metrics::set_queue_depth(self.queue.len());
        Ok(())
    }

    pub fn set_retry_mode(&self, queue_id: QueueId, mode: RetryMode, actor: &str) -> Result<QueueEntryView> {
        let now = self.clock.now();
        let mutation = self.queue.set_mode(queue_id, mode, actor, now)?;
        self.audit.record_queue(&mutation);
        Ok(mutation.entry.view(now))
    }

    pub fn queue_entry(&self, queue_id: QueueId) -> Result<QueueEntryView> {
        Ok(self.queue.get(queue_id)?.view(self.clock.now()))
    }

    pub fn list_queue(&self, filter: &QueueFilter) -> Vec<QueueEntryView> {
        let now = self.clock.now();
        self.queue.list(filter).iter().map(|e| e.view(now)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // History
    // ─────────────────────────────────────────────────────────────────────────

    pub fn history(&self, filter: &HistoryFilter) -> Vec<TaskHistory> {
        self.registry.history(filter)
    }

    pub fn task(&self, task_id: TaskId) -> Result<TaskHistory> {
        self.registry.task_history(task_id)
    }

    pub fn export_audit(&self) -> Result<AuditExport> {
        self.audit.export_ndjson()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    /// Force-fail running tasks older than the execution timeout.
    ///
    /// No signal reaches the runner; its later report is rejected.
    pub fn run_watchdog(&self) -> Vec<TaskId> {
        let now = self.clock.now();
        let mut timed_out = Vec::new();

        for task_id in self.registry.timed_out(self.execution_timeout, now) {
            match self.record_outcome(task_id, TaskOutcome::timeout()) {
                Ok(_) => {
                    tracing::warn!(
                        task_id = %task_id,
                        timeout_secs = self.execution_timeout.as_secs(),
                        "Task exceeded execution timeout"
                    );
                    metrics::record_watchdog_timeout();
                    timed_out.push(task_id);
                }
                // Raced with the runner's own outcome
                Err(e) if e.code() == ErrorCode::OutcomeAlreadyRecorded => {}
                Err(e) => e.log(),
            }
        }
        timed_out
    }

    /// One scheduler pass: clear elapsed cooldowns, run the watchdog, then
    /// retry every eligible auto-mode entry.
    pub fn tick(self: &Arc<Self>) -> TickReport {
        let mut report = TickReport {
            cooldowns_cleared: self.queue.clear_elapsed_cooldowns(self.clock.now()),
            timed_out: self.run_watchdog(),
            ..Default::default()
        };

        for queue_id in self.queue.eligible_auto(self.clock.now()) {
            match self.retry(queue_id, RetryCommand::new(SCHEDULER_ACTOR)) {
                Ok(_) => report.retried.push(queue_id),
                Err(e) if is_contention(&e) => {
                    tracing::debug!(queue_id = %queue_id, reason = %e, "Skipping retry this tick");
                    report.skipped.push(queue_id);
                }
                Err(e) => {
                    e.log();
                    report.skipped.push(queue_id);
                }
            }
        }

        metrics::set_queue_depth(self.queue.len());
        report
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            total_tasks: self.registry.len(),
            running_tasks: self.registry.count_by_status(TaskStatus::Running),
            queue_depth: self.queue.len(),
            audit_records: self.audit.len(),
        }
    }

    fn audit_transition(&self, transition: &Transition) {
        self.audit.record_history(&transition.event);
    }
}

fn is_contention(error: &ReindexError) -> bool {
    matches!(
        error.code(),
        ErrorCode::ScopeBusy | ErrorCode::NotEligible | ErrorCode::QueueEntryNotFound
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::ManualClock;
    use crate::jobs::evidence::EvidenceDiff;
    use crate::jobs::runner::ScriptedRunner;

    fn engine_with(runner: ScriptedRunner, clock: Arc<ManualClock>) -> Arc<ReindexEngine> {
        ReindexEngine::builder(Arc::new(runner))
            .with_policy(CooldownPolicy::new(Duration::from_secs(60), Duration::from_secs(3600)))
            .with_clock(clock)
            .build()
    }

    async fn settle(engine: &ReindexEngine, task_id: TaskId) -> ReindexTask {
        for _ in 0..200 {
            let task = engine.registry().get(task_id).unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never finished", task_id);
    }

    #[tokio::test]
    async fn test_submit_returns_running_task() {
        let clock = Arc::new(ManualClock::default());
        let engine = engine_with(ScriptedRunner::default().with_delay(Duration::from_millis(20)), clock);

        let task = engine
            .submit(SubmitCommand::new(ReindexScope::All, "ops"))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        let done = settle(&engine, task.task_id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(engine.queue().is_empty());
    }

    #[tokio::test]
    async fn test_failure_creates_single_queue_entry() {
        let clock = Arc::new(ManualClock::default());
        let engine = engine_with(
            ScriptedRunner::default().with_fallback(TaskOutcome::failure("QUOTA")),
            clock,
        );
        let scope = ReindexScope::sources(["news"]).unwrap();

        let t1 = engine.submit(SubmitCommand::new(scope.clone(), "ops")).unwrap();
        settle(&engine, t1.task_id).await;
        let t2 = engine.submit(SubmitCommand::new(scope, "ops")).unwrap();
        settle(&engine, t2.task_id).await;

        let entries = engine.list_queue(&QueueFilter::new());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry.original_task_id, t1.task_id);
        assert_eq!(entries[0].entry.last_task_id, t2.task_id);
    }

    #[tokio::test]
    async fn test_retry_rollback_when_scope_busy() {
        let clock = Arc::new(ManualClock::default());
        let runner = ScriptedRunner::new([TaskOutcome::failure("E")]);
        let engine = engine_with(runner.with_delay(Duration::from_millis(30)), clock.clone());
        let scope = ReindexScope::sources(["filings"]).unwrap();

        let t1 = engine.submit(SubmitCommand::new(scope.clone(), "ops")).unwrap();
        settle(&engine, t1.task_id).await;
        let queue_id = engine.list_queue(&QueueFilter::new())[0].entry.queue_id;

        // Block the scope with a fresh submission
        let blocker = engine.submit(SubmitCommand::new(ReindexScope::All, "ops")).unwrap();
        let err = engine
            .retry(queue_id, RetryCommand::new("ops").forced())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ScopeBusy);

        let entry = engine.queue_entry(queue_id).unwrap().entry;
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.retry_mode, RetryMode::Auto);
        settle(&engine, blocker.task_id).await;
    }

    #[tokio::test]
    async fn test_partial_outcome_truncates_samples() {
        let clock = Arc::new(ManualClock::default());
        let mut diff = EvidenceDiff::new(40, 0, 0);
        for i in 0..40 {
            diff = diff.with_sample(crate::jobs::evidence::EvidenceSample::new(
                crate::jobs::evidence::DiffType::Created,
                format!("src-{}", i),
            ));
        }
        let engine = engine_with(ScriptedRunner::new([TaskOutcome::partial(diff)]), clock);

        let task = engine.submit(SubmitCommand::new(ReindexScope::All, "ops")).unwrap();
        let done = settle(&engine, task.task_id).await;
        assert_eq!(done.status, TaskStatus::Partial);
        let evidence = done.evidence_diff.unwrap();
        assert_eq!(evidence.samples.len(), 20);
        assert_eq!(evidence.created, 40);
    }

    #[tokio::test]
    async fn test_stats_reflect_state() {
        let clock = Arc::new(ManualClock::default());
        let engine = engine_with(ScriptedRunner::new([TaskOutcome::failure("E")]), clock);
        let task = engine.submit(SubmitCommand::new(ReindexScope::All, "ops")).unwrap();
        settle(&engine, task.task_id).await;

        let stats = engine.stats();
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.queue_depth, 1);
        assert_eq!(stats.running_tasks, 0);
        // queued, running, failed events plus the queue creation
        assert_eq!(stats.audit_records, 4);
    }
}
