//! Append-only task history.
//!
//! Every task transition appends one [`HistoryEvent`]. Events are never
//! mutated or removed; the latest event of a task always equals its status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::jobs::task::{ReindexTask, TaskId, TaskStatus};
use crate::observability::trace::TraceLink;

/// One recorded transition of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Global append order
    pub sequence: u64,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceLink>,
}

/// A task together with its timeline, newest event first.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHistory {
    pub task: ReindexTask,
    pub latest: HistoryEvent,
    pub events: Vec<HistoryEvent>,
}

/// Filter for history queries. An empty status set matches every status.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub statuses: HashSet<TaskStatus>,
    pub search: Option<String>,
}

impl HistoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.insert(status);
        self
    }

    pub fn with_search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn matches(&self, task: &ReindexTask, latest: &HistoryEvent) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&latest.status) {
            return false;
        }
        match &self.search {
            Some(text) => task.matches_text(text),
            None => true,
        }
    }
}

/// In-memory append-only event log indexed by task.
#[derive(Debug, Default)]
pub struct HistoryLog {
    events: Vec<HistoryEvent>,
    by_task: HashMap<TaskId, Vec<usize>>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event. Timestamps never go backwards within a task.
    pub fn append(
        &mut self,
        task_id: TaskId,
        status: TaskStatus,
        timestamp: DateTime<Utc>,
        note: Option<String>,
        trace: Option<TraceLink>,
    ) -> HistoryEvent {
        let timestamp = self
            .latest(task_id)
            .map_or(timestamp, |last| timestamp.max(last.timestamp));

        let event = HistoryEvent {
            sequence: self.events.len() as u64,
            task_id,
            status,
            timestamp,
            note,
            trace,
        };

        self.by_task.entry(task_id).or_default().push(self.events.len());
        self.events.push(event.clone());
        event
    }

    pub fn latest(&self, task_id: TaskId) -> Option<&HistoryEvent> {
        self.by_task
            .get(&task_id)
            .and_then(|indices| indices.last())
            .map(|&i| &self.events[i])
    }

    /// Reverse-chronological timeline for one task.
    pub fn timeline(&self, task_id: TaskId) -> Vec<HistoryEvent> {
        self.by_task
            .get(&task_id)
            .map(|indices| indices.iter().rev().map(|&i| self.events[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Task ids ordered by their latest event, most recent first.
    pub fn tasks_by_recency(&self) -> Vec<TaskId> {
        let mut ids: Vec<(u64, TaskId)> = self
            .by_task
            .iter()
            .filter_map(|(id, indices)| indices.last().map(|&i| (self.events[i].sequence, *id)))
            .collect();
        ids.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.events.iter()
    }
}
