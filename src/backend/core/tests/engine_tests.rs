//! End-to-end tests for the reindex engine.
//!
//! Tests cover:
//! - Failure routing into the retry queue and cooldown windows
//! - Eligibility, auto exhaustion, and forced manual retries
//! - Resolution on success and history isolation
//! - Scope locking under concurrent submission
//! - Queue dismissal, the execution watchdog, and the audit trail
//!
//! Runs are parked so that each test drives outcomes explicitly through
//! `record_outcome` against a manual clock.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reindex_core::audit::AuditRecord;
use reindex_core::error::ErrorCode;
use reindex_core::jobs::{
    Clock, CooldownPolicy, EvidenceDiff, ExecutionRunner, HistoryFilter, ManualClock, MutationKind,
    QueueFilter, QueueStatus, ReindexEngine, ReindexScope, RetryCommand, RetryMode, RetryState,
    RunRequest, SubmitCommand, TaskOutcome, TaskStatus, TIMEOUT_ERROR_CODE,
};
use std::sync::Arc;
use std::time::Duration;

/// Never reports; outcomes are injected by the test.
struct ParkedRunner;

#[async_trait]
impl ExecutionRunner for ParkedRunner {
    fn name(&self) -> &'static str {
        "parked"
    }

    async fn run(&self, _request: RunRequest) -> TaskOutcome {
        std::future::pending().await
    }
}

const BASE: u64 = 60;

fn setup() -> (Arc<ReindexEngine>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let engine = ReindexEngine::builder(Arc::new(ParkedRunner))
        .with_policy(CooldownPolicy::new(Duration::from_secs(BASE), Duration::from_secs(3600)))
        .with_max_attempts(3)
        .with_execution_timeout(Duration::from_secs(1800))
        .with_clock(clock.clone())
        .build();
    (engine, clock)
}

fn filings() -> ReindexScope {
    ReindexScope::sources(["filings"]).unwrap()
}

// ============================================================================
// Scenario Tests
// ============================================================================

#[tokio::test]
async fn test_failure_creates_cooling_down_entry() {
    let (engine, clock) = setup();
    let now = clock.now();

    let t1 = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    assert_eq!(t1.status, TaskStatus::Running);

    let failed = engine
        .record_outcome(t1.task_id, TaskOutcome::failure("EMBEDDING_TIMEOUT"))
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some("EMBEDDING_TIMEOUT"));

    let entries = engine.list_queue(&QueueFilter::new());
    assert_eq!(entries.len(), 1);
    let view = &entries[0];
    assert_eq!(view.entry.attempts, 0);
    assert_eq!(view.entry.max_attempts, 3);
    assert_eq!(view.entry.original_task_id, t1.task_id);
    assert_eq!(view.entry.cooldown_until, Some(now + ChronoDuration::seconds(BASE as i64)));
    assert_eq!(view.retry_state, RetryState::CoolingDown);
    assert!(!view.eligible);
}

#[tokio::test]
async fn test_retry_rejected_until_cooldown_elapses() {
    let (engine, clock) = setup();
    let t1 = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    engine.record_outcome(t1.task_id, TaskOutcome::failure("EMBEDDING_TIMEOUT")).unwrap();
    let queue_id = engine.list_queue(&QueueFilter::new())[0].entry.queue_id;

    let err = engine.retry(queue_id, RetryCommand::new("ops")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotEligible);
    assert!(err.details().retry_after_secs.is_some());

    clock.advance(ChronoDuration::seconds(BASE as i64));
    let entry = engine.retry(queue_id, RetryCommand::new("ops")).unwrap();
    assert_eq!(entry.attempts, 1);
    assert_eq!(entry.status, QueueStatus::Running);

    let t2 = entry.current_task_id.unwrap();
    assert_ne!(t2, t1.task_id);
    let task = engine.task(t2).unwrap().task;
    assert_eq!(task.retry_of, Some(queue_id));
    assert_eq!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_auto_exhaustion_then_forced_manual_retry() {
    let (engine, clock) = setup();
    let t1 = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    engine.record_outcome(t1.task_id, TaskOutcome::failure("EMBEDDING_TIMEOUT")).unwrap();
    let queue_id = engine.list_queue(&QueueFilter::new())[0].entry.queue_id;

    for _ in 0..3 {
        clock.advance(ChronoDuration::hours(2));
        let entry = engine.retry(queue_id, RetryCommand::new("ops")).unwrap();
        let task_id = entry.current_task_id.unwrap();
        engine.record_outcome(task_id, TaskOutcome::failure("EMBEDDING_TIMEOUT")).unwrap();
    }

    clock.advance(ChronoDuration::days(1));
    let view = engine.queue_entry(queue_id).unwrap();
    assert_eq!(view.entry.attempts, 3);
    assert_eq!(view.entry.status, QueueStatus::Failed);
    assert!(!view.eligible);
    assert_eq!(view.retry_state, RetryState::AutoExhausted);
    assert_eq!(view.attempts_remaining, Some(0));

    let err = engine.retry(queue_id, RetryCommand::new("ops")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotEligible);

    let entry = engine.retry(queue_id, RetryCommand::new("oncall").forced()).unwrap();
    assert_eq!(entry.status, QueueStatus::Running);
    assert_eq!(entry.retry_mode, RetryMode::Manual);
    assert_eq!(entry.attempts, 4);
}

#[tokio::test]
async fn test_forced_retry_during_cooldown_stays_automatic() {
    let (engine, clock) = setup();
    let t1 = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    engine.record_outcome(t1.task_id, TaskOutcome::failure("EMBEDDING_TIMEOUT")).unwrap();
    let queue_id = engine.list_queue(&QueueFilter::new())[0].entry.queue_id;

    let entry = engine
        .retry(queue_id, RetryCommand::new("oncall").with_note("index rebuilt").forced())
        .unwrap();
    assert_eq!(entry.retry_mode, RetryMode::Auto);
    assert_eq!(entry.attempts, 1);
    assert_eq!(entry.note.as_deref(), Some("index rebuilt"));

    let claimed = engine
        .audit()
        .records()
        .into_iter()
        .find_map(|r| match r {
            AuditRecord::QueueMutation(m) if m.kind == MutationKind::Claimed => Some(m),
            _ => None,
        })
        .unwrap();
    assert_eq!(claimed.entry.note.as_deref(), Some("index rebuilt"));

    let task_id = entry.current_task_id.unwrap();
    engine.record_outcome(task_id, TaskOutcome::failure("EMBEDDING_TIMEOUT")).unwrap();
    let view = engine.queue_entry(queue_id).unwrap();
    assert_eq!(view.retry_state, RetryState::CoolingDown);
    assert_eq!(view.attempts_remaining, Some(2));

    clock.advance(ChronoDuration::seconds(2 * BASE as i64));
    assert!(engine.queue_entry(queue_id).unwrap().eligible);
}

#[tokio::test]
async fn test_successful_retry_resolves_entry() {
    let (engine, clock) = setup();
    let t1 = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    engine.record_outcome(t1.task_id, TaskOutcome::failure("EMBEDDING_TIMEOUT")).unwrap();
    let queue_id = engine.list_queue(&QueueFilter::new())[0].entry.queue_id;
    let t1_before = engine.task(t1.task_id).unwrap();

    clock.advance(ChronoDuration::seconds(BASE as i64));
    let t2 = engine
        .retry(queue_id, RetryCommand::new("ops"))
        .unwrap()
        .current_task_id
        .unwrap();

    let done = engine
        .record_outcome(t2, TaskOutcome::success(EvidenceDiff::new(5, 2, 0)))
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.evidence_diff.as_ref().map(|d| d.total_changes()), Some(7));

    assert!(engine.list_queue(&QueueFilter::new()).is_empty());
    assert_eq!(
        engine.queue_entry(queue_id).unwrap_err().code(),
        ErrorCode::QueueEntryNotFound
    );

    let t1_after = engine.task(t1.task_id).unwrap();
    assert_eq!(t1_before.events, t1_after.events);
    assert_eq!(t1_after.task.status, TaskStatus::Failed);
}

// ============================================================================
// Invariant Tests
// ============================================================================

#[tokio::test]
async fn test_repeated_failure_updates_single_entry() {
    let (engine, _clock) = setup();
    let first = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    engine.record_outcome(first.task_id, TaskOutcome::failure("A")).unwrap();
    let second = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    engine.record_outcome(second.task_id, TaskOutcome::failure("B")).unwrap();

    let entries = engine.list_queue(&QueueFilter::new());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry.last_error.as_deref(), Some("B"));
    assert_eq!(entries[0].entry.last_task_id, second.task_id);
    assert_eq!(entries[0].entry.attempts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_for_one_scope() {
    let (engine, _clock) = setup();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.submit(SubmitCommand::new(filings(), format!("actor-{}", i)))
            })
        })
        .collect();

    let mut accepted = 0;
    let mut busy = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => {
                assert_eq!(e.code(), ErrorCode::ScopeBusy);
                busy += 1;
            }
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(busy, 7);
}

#[tokio::test]
async fn test_overlapping_scope_is_busy() {
    let (engine, _clock) = setup();
    engine
        .submit(SubmitCommand::new(ReindexScope::sources(["news", "filings"]).unwrap(), "ops"))
        .unwrap();

    let err = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ScopeBusy);
    let err = engine.submit(SubmitCommand::new(ReindexScope::All, "ops")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ScopeBusy);

    engine
        .submit(SubmitCommand::new(ReindexScope::sources(["press"]).unwrap(), "ops"))
        .unwrap();
}

#[tokio::test]
async fn test_remove_is_final() {
    let (engine, _clock) = setup();
    let t1 = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    engine.record_outcome(t1.task_id, TaskOutcome::failure("E")).unwrap();
    let queue_id = engine.list_queue(&QueueFilter::new())[0].entry.queue_id;

    engine.remove(queue_id, Some("ops")).unwrap();
    assert!(engine
        .list_queue(&QueueFilter::new())
        .iter()
        .all(|v| v.entry.queue_id != queue_id));

    let err = engine.remove(queue_id, Some("ops")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueueEntryNotFound);

    // history survives dismissal
    assert_eq!(engine.task(t1.task_id).unwrap().task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_duration_matches_timestamps() {
    let (engine, clock) = setup();
    let task = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    clock.advance(ChronoDuration::milliseconds(4_250));
    let done = engine
        .record_outcome(task.task_id, TaskOutcome::partial(EvidenceDiff::new(1, 0, 0)))
        .unwrap();

    let started = done.started_at.unwrap();
    let finished = done.finished_at.unwrap();
    assert!(started <= finished);
    assert_eq!(done.duration_ms, Some((finished - started).num_milliseconds()));
    assert_eq!(done.duration_ms, Some(4_250));
    assert_eq!(done.status, TaskStatus::Partial);
}

// ============================================================================
// Watchdog & Scheduler Tests
// ============================================================================

#[tokio::test]
async fn test_watchdog_fails_stuck_task_and_rejects_late_outcome() {
    let (engine, clock) = setup();
    let task = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();

    clock.advance(ChronoDuration::minutes(29));
    assert!(engine.run_watchdog().is_empty());

    clock.advance(ChronoDuration::minutes(1));
    assert_eq!(engine.run_watchdog(), vec![task.task_id]);

    let failed = engine.task(task.task_id).unwrap().task;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some(TIMEOUT_ERROR_CODE));
    assert_eq!(engine.list_queue(&QueueFilter::new()).len(), 1);

    let err = engine
        .record_outcome(task.task_id, TaskOutcome::success(EvidenceDiff::default()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::OutcomeAlreadyRecorded);
}

#[tokio::test]
async fn test_tick_retries_only_eligible_auto_entries() {
    let (engine, clock) = setup();

    let auto = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    engine.record_outcome(auto.task_id, TaskOutcome::failure("E")).unwrap();
    let manual_scope = ReindexScope::sources(["news"]).unwrap();
    let manual = engine.submit(SubmitCommand::new(manual_scope, "ops")).unwrap();
    engine.record_outcome(manual.task_id, TaskOutcome::failure("E")).unwrap();

    let manual_id = engine
        .list_queue(&QueueFilter::new().with_search("news"))[0]
        .entry
        .queue_id;
    engine.set_retry_mode(manual_id, RetryMode::Manual, "ops").unwrap();

    let report = engine.tick();
    assert!(report.retried.is_empty());

    clock.advance(ChronoDuration::seconds(BASE as i64));
    let report = engine.tick();
    assert_eq!(report.retried.len(), 1);
    assert_eq!(report.cooldowns_cleared, 1);

    let manual_view = engine.queue_entry(manual_id).unwrap();
    assert_eq!(manual_view.entry.attempts, 0);
    assert_eq!(manual_view.retry_state, RetryState::Manual);

    let retried = engine.queue_entry(report.retried[0]).unwrap();
    assert_eq!(retried.retry_state, RetryState::InFlight);
    let task = engine.task(retried.entry.current_task_id.unwrap()).unwrap().task;
    assert_eq!(task.actor, "scheduler");
}

// ============================================================================
// History & Audit Tests
// ============================================================================

#[tokio::test]
async fn test_history_filters_by_status_and_text() {
    let (engine, _clock) = setup();
    let failed = engine.submit(SubmitCommand::new(filings(), "alice")).unwrap();
    engine.record_outcome(failed.task_id, TaskOutcome::failure("QUOTA")).unwrap();
    let running = engine
        .submit(SubmitCommand::new(ReindexScope::sources(["news"]).unwrap(), "bob"))
        .unwrap();

    let only_failed = engine.history(&HistoryFilter::new().with_status(TaskStatus::Failed));
    assert_eq!(only_failed.len(), 1);
    assert_eq!(only_failed[0].task.task_id, failed.task_id);

    let by_actor = engine.history(&HistoryFilter::new().with_search("BOB"));
    assert_eq!(by_actor.len(), 1);
    assert_eq!(by_actor[0].task.task_id, running.task_id);

    let by_code = engine.history(&HistoryFilter::new().with_search("quota"));
    assert_eq!(by_code.len(), 1);

    assert_eq!(engine.history(&HistoryFilter::new()).len(), 2);
}

#[tokio::test]
async fn test_audit_trail_records_every_change() {
    let (engine, clock) = setup();
    let t1 = engine.submit(SubmitCommand::new(filings(), "ops")).unwrap();
    engine.record_outcome(t1.task_id, TaskOutcome::failure("E")).unwrap();
    let queue_id = engine.list_queue(&QueueFilter::new())[0].entry.queue_id;
    clock.advance(ChronoDuration::seconds(BASE as i64));
    engine.retry(queue_id, RetryCommand::new("ops")).unwrap();

    let kinds: Vec<MutationKind> = engine
        .audit()
        .records()
        .into_iter()
        .filter_map(|r| match r {
            AuditRecord::QueueMutation(m) => Some(m.kind),
            AuditRecord::HistoryEvent(_) => None,
        })
        .collect();
    assert_eq!(kinds, vec![MutationKind::Created, MutationKind::Claimed]);

    let export = engine.export_audit().unwrap();
    assert!(export.is_complete());
    // queued, running, failed, created, claimed, retrying, running
    assert_eq!(export.body.lines().count(), 7);
    for line in export.body.lines() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value.get("record").is_some());
    }
}
