//! Job registry: canonical task state and history.
//!
//! All mutations go through one lock so that the scope check in [`JobRegistry::submit`]
//! and the lock release in [`JobRegistry::record_outcome`] are atomic with the
//! state transition they guard.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ReindexError, Result};
use crate::jobs::history::{HistoryEvent, HistoryFilter, HistoryLog, TaskHistory};
use crate::jobs::retry_queue::QueueId;
use crate::jobs::task::{ReindexScope, ReindexTask, TaskId, TaskOutcome, TaskStatus};
use crate::observability::trace::TraceLink;

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub scope: ReindexScope,
    pub actor: String,
    pub note: Option<String>,
    pub trace: Option<TraceLink>,
    pub retry_of: Option<QueueId>,
}

impl SubmitRequest {
    pub fn new(scope: ReindexScope, actor: impl Into<String>) -> Self {
        Self {
            scope,
            actor: actor.into(),
            note: None,
            trace: None,
            retry_of: None,
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }

    pub fn with_trace(mut self, trace: Option<TraceLink>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_retry_of(mut self, queue_id: QueueId) -> Self {
        self.retry_of = Some(queue_id);
        self
    }
}

/// A task snapshot paired with the history event its transition produced.
#[derive(Debug, Clone)]
pub struct Transition {
    pub task: ReindexTask,
    pub event: HistoryEvent,
}

#[derive(Debug, Default)]
struct RegistryState {
    tasks: HashMap<TaskId, ReindexTask>,
    history: HistoryLog,
}

impl RegistryState {
    fn active_overlapping(&self, scope: &ReindexScope) -> Option<&ReindexTask> {
        self.tasks
            .values()
            .find(|task| task.status.is_active() && task.scope.overlaps(scope))
    }

    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut ReindexTask> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| ReindexError::task_not_found(task_id))
    }

    fn grouped(&self, task_id: TaskId) -> Option<TaskHistory> {
        let task = self.tasks.get(&task_id)?;
        let latest = self.history.latest(task_id)?;
        Some(TaskHistory {
            task: task.clone(),
            latest: latest.clone(),
            events: self.history.timeline(task_id),
        })
    }
}

/// Owns every submitted [`ReindexTask`] and its history.
#[derive(Debug, Default)]
pub struct JobRegistry {
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task for the scope.
    ///
    /// Fails with `ScopeBusy` while any queued or running task overlaps the scope.
    pub fn submit(&self, request: SubmitRequest, now: DateTime<Utc>) -> Result<Transition> {
        let mut state = self.state.lock();

        if let Some(active) = state.active_overlapping(&request.scope) {
            return Err(ReindexError::scope_busy(request.scope.label(), active.task_id));
        }

        let mut task = ReindexTask::new(request.scope, request.actor, now)
            .with_note(request.note)
            .with_trace(request.trace);
        if let Some(queue_id) = request.retry_of {
            task = task.as_retry_of(queue_id);
        }

        let event = state.history.append(
            task.task_id,
            task.status,
            now,
            task.note.clone(),
            task.trace.clone(),
        );
        state.tasks.insert(task.task_id, task.clone());

        tracing::info!(
            task_id = %task.task_id,
            scope = %task.scope,
            actor = %task.actor,
            status = %task.status,
            "Reindex task submitted"
        );

        Ok(Transition { task, event })
    }

    /// Move a queued task to `running`.
    pub fn mark_running(
        &self,
        task_id: TaskId,
        trace: Option<TraceLink>,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        task.start(now)?;
        let task = task.clone();

        let event = state.history.append(task_id, task.status, now, None, trace);
        Ok(Transition { task, event })
    }

    /// Apply a terminal outcome and release the scope.
    ///
    /// An outcome for a task that already finished is rejected.
    pub fn record_outcome(
        &self,
        task_id: TaskId,
        outcome: TaskOutcome,
        note: Option<String>,
        trace: Option<TraceLink>,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        task.finish(outcome, now)?;
        let task = task.clone();

        // Event time matches finished_at so duration and timeline agree
        let at = task.finished_at.unwrap_or(now);
        let event = state.history.append(task_id, task.status, at, note, trace);

        tracing::info!(
            task_id = %task_id,
            scope = %task.scope,
            status = %task.status,
            duration_ms = ?task.duration_ms,
            error_code = ?task.error_code,
            "Reindex task finished"
        );

        Ok(Transition { task, event })
    }

    pub fn get(&self, task_id: TaskId) -> Result<ReindexTask> {
        self.state
            .lock()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| ReindexError::task_not_found(task_id))
    }

    /// One task with its full timeline.
    pub fn task_history(&self, task_id: TaskId) -> Result<TaskHistory> {
        self.state
            .lock()
            .grouped(task_id)
            .ok_or_else(|| ReindexError::task_not_found(task_id))
    }

    /// Grouped history, most recently updated task first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<TaskHistory> {
        let state = self.state.lock();
        state
            .history
            .tasks_by_recency()
            .into_iter()
            .filter_map(|task_id| state.grouped(task_id))
            .filter(|group| filter.matches(&group.task, &group.latest))
            .collect()
    }

    /// Running tasks whose start is at least `timeout` before `now`.
    pub fn timed_out(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<TaskId> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        self.state
            .lock()
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Running)
            .filter(|task| task.started_at.is_some_and(|started| now - started >= timeout))
            .map(|task| task.task_id)
            .collect()
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|task| task.status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
