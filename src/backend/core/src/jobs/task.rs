//! Reindex task definitions.
//!
//! A [`ReindexTask`] is one attempt at reindexing a [`ReindexScope`]. Tasks are
//! created by submission (or by a retry), move through
//! `queued -> running -> {completed | partial | failed}` and are never deleted.
//! A retry always creates a new task; the failed one stays terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::error::{ReindexError, Result};
use crate::jobs::evidence::EvidenceDiff;
use crate::jobs::retry_queue::QueueId;
use crate::observability::trace::TraceLink;

/// Error code recorded when the watchdog force-fails a task.
pub const TIMEOUT_ERROR_CODE: &str = "timeout";

// ═══════════════════════════════════════════════════════════════════════════════
// Task Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a reindex task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scope
// ═══════════════════════════════════════════════════════════════════════════════

const ALL_KEYWORD: &str = "all";

/// The data sources targeted by a reindex task.
///
/// On the wire a scope is either the string `"all"` or a list of source keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ScopeInput", into = "ScopeInput")]
pub enum ReindexScope {
    All,
    Sources(BTreeSet<String>),
}

/// Raw scope as supplied by callers, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeInput {
    Keyword(String),
    Keys(Vec<String>),
}

impl Default for ScopeInput {
    fn default() -> Self {
        Self::Keys(Vec::new())
    }
}

impl ReindexScope {
    /// Build a source scope, trimming keys and rejecting empty input.
    ///
    /// A list that names `all` collapses to [`ReindexScope::All`].
    pub fn sources<I, S>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for key in keys {
            let key = key.as_ref().trim();
            if key.is_empty() {
                return Err(ReindexError::invalid_scope("source keys must not be blank"));
            }
            if key.eq_ignore_ascii_case(ALL_KEYWORD) {
                return Ok(Self::All);
            }
            set.insert(key.to_string());
        }
        if set.is_empty() {
            return Err(ReindexError::invalid_scope("scope must not be empty"));
        }
        Ok(Self::Sources(set))
    }

    /// Canonical label: `all`, or the sorted keys joined by commas.
    pub fn label(&self) -> String {
        match self {
            Self::All => ALL_KEYWORD.to_string(),
            Self::Sources(keys) => keys.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }

    /// Two scopes overlap if either is `all` or they share a source key.
    pub fn overlaps(&self, other: &ReindexScope) -> bool {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => true,
            (Self::Sources(a), Self::Sources(b)) => !a.is_disjoint(b),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Whether any scope label contains `needle` (already lowercased).
    pub fn matches_text(&self, needle: &str) -> bool {
        match self {
            Self::All => ALL_KEYWORD.contains(needle),
            Self::Sources(keys) => keys.iter().any(|k| k.to_lowercase().contains(needle)),
        }
    }
}

impl TryFrom<ScopeInput> for ReindexScope {
    type Error = ReindexError;

    fn try_from(input: ScopeInput) -> Result<Self> {
        match input {
            ScopeInput::Keyword(word) => Self::sources([word]),
            ScopeInput::Keys(keys) => Self::sources(keys),
        }
    }
}

impl From<ReindexScope> for ScopeInput {
    fn from(scope: ReindexScope) -> Self {
        match scope {
            ReindexScope::All => ScopeInput::Keyword(ALL_KEYWORD.to_string()),
            ReindexScope::Sources(keys) => ScopeInput::Keys(keys.into_iter().collect()),
        }
    }
}

impl fmt::Display for ReindexScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a reindex task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, waiting for dispatch
    Queued,
    /// Created by a retry, waiting for dispatch
    Retrying,
    /// Handed to the execution runner
    Running,
    /// Finished without errors
    Completed,
    /// Finished with some sources skipped
    Partial,
    /// Finished with an error; a queue entry tracks the retry
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Queued,
        Self::Retrying,
        Self::Running,
        Self::Completed,
        Self::Partial,
        Self::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }

    /// Active tasks hold the lock on their scope.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued | Retrying, Running) | (Running, Completed | Partial | Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Retrying => write!(f, "retrying"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ReindexError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ReindexError::validation(format!("Unknown task status: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Result reported for a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { evidence: EvidenceDiff },
    Partial { evidence: EvidenceDiff },
    Failure {
        error_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl TaskOutcome {
    pub fn success(evidence: EvidenceDiff) -> Self {
        Self::Success { evidence }
    }

    pub fn partial(evidence: EvidenceDiff) -> Self {
        Self::Partial { evidence }
    }

    pub fn failure(error_code: impl Into<String>) -> Self {
        Self::Failure {
            error_code: error_code.into(),
            message: None,
        }
    }

    pub fn failure_with_message(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure {
            error_code: error_code.into(),
            message: Some(message.into()),
        }
    }

    pub fn timeout() -> Self {
        Self::failure_with_message(TIMEOUT_ERROR_CODE, "execution timeout exceeded")
    }

    /// The terminal status this outcome produces.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Success { .. } => TaskStatus::Completed,
            Self::Partial { .. } => TaskStatus::Partial,
            Self::Failure { .. } => TaskStatus::Failed,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reindex Task
// ═══════════════════════════════════════════════════════════════════════════════

/// One reindex attempt for a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexTask {
    pub task_id: TaskId,
    pub scope: ReindexScope,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceLink>,
    /// Only set on completed and partial tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_diff: Option<EvidenceDiff>,
    /// Only set on failed tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Queue entry that spawned this task, if it is a retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<QueueId>,
}

impl ReindexTask {
    /// Create a task in the `queued` state.
    pub fn new(scope: ReindexScope, actor: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: TaskId::new(),
            scope,
            actor: actor.into(),
            note: None,
            status: TaskStatus::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            trace: None,
            evidence_diff: None,
            error_code: None,
            error_message: None,
            retry_of: None,
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn with_trace(mut self, trace: Option<TraceLink>) -> Self {
        self.trace = trace;
        self
    }

    /// Mark this task as a retry spawned by a queue entry.
    pub fn as_retry_of(mut self, queue_id: QueueId) -> Self {
        self.retry_of = Some(queue_id);
        self.status = TaskStatus::Retrying;
        self
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(ReindexError::outcome_already_recorded(self.task_id, self.status));
        }
        if !self.status.can_transition_to(next) {
            return Err(ReindexError::invalid_state_transition(self.task_id, self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Hand the task to the runner.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Apply a terminal outcome. Fails if the task is not running.
    pub fn finish(&mut self, outcome: TaskOutcome, now: DateTime<Utc>) -> Result<()> {
        self.transition(outcome.status())?;

        let started = self.started_at.unwrap_or(now);
        let finished = now.max(started);
        self.finished_at = Some(finished);
        self.duration_ms = Some((finished - started).num_milliseconds());

        match outcome {
            TaskOutcome::Success { evidence } | TaskOutcome::Partial { evidence } => {
                self.evidence_diff = Some(evidence);
            }
            TaskOutcome::Failure { error_code, message } => {
                self.error_code = Some(error_code);
                self.error_message = message;
            }
        }
        Ok(())
    }

    /// Case-insensitive search over actor, scope labels and error code.
    pub fn matches_text(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.actor.to_lowercase().contains(&needle)
            || self.scope.matches_text(&needle)
            || self
                .error_code
                .as_deref()
                .is_some_and(|code| code.to_lowercase().contains(&needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_scope_normalization() {
        let scope = ReindexScope::sources([" filings ", "news", "filings"]).unwrap();
        assert_eq!(scope.label(), "filings,news");

        let all = ReindexScope::sources(["filings", "ALL"]).unwrap();
        assert!(all.is_all());
        assert_eq!(all.label(), "all");
    }

    #[test]
    fn test_scope_rejects_empty() {
        let err = ReindexScope::sources(Vec::<String>::new()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidScope);
        assert!(ReindexScope::sources(["  "]).is_err());
    }

    #[test]
    fn test_scope_overlap() {
        let ab = ReindexScope::sources(["a", "b"]).unwrap();
        let b = ReindexScope::sources(["b"]).unwrap();
        let c = ReindexScope::sources(["c"]).unwrap();

        assert!(ab.overlaps(&b));
        assert!(!ab.overlaps(&c));
        assert!(ReindexScope::All.overlaps(&c));
    }

    #[test]
    fn test_scope_wire_format() {
        let scope: ReindexScope = serde_json::from_str(r#"["news","filings"]"#).unwrap();
        assert_eq!(serde_json::to_string(&scope).unwrap(), r#"["filings","news"]"#);

        let all: ReindexScope = serde_json::from_str(r#""all""#).unwrap();
        assert_eq!(serde_json::to_string(&all).unwrap(), r#""all""#);

        assert!(serde_json::from_str::<ReindexScope>("[]").is_err());
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Partial));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("Failed".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
        assert!("exploded".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_finish_sets_duration() {
        let now = Utc::now();
        let mut task = ReindexTask::new(ReindexScope::All, "ops", now);
        task.start(now).unwrap();
        task.finish(
            TaskOutcome::success(EvidenceDiff::new(1, 0, 0)),
            now + Duration::milliseconds(1500),
        )
        .unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.duration_ms, Some(1500));
        assert!(task.started_at <= task.finished_at);
        assert!(task.error_code.is_none());
    }

    #[test]
    fn test_second_outcome_is_rejected() {
        let now = Utc::now();
        let mut task = ReindexTask::new(ReindexScope::All, "ops", now);
        task.start(now).unwrap();
        task.finish(TaskOutcome::failure("EMBEDDING_TIMEOUT"), now).unwrap();

        let err = task
            .finish(TaskOutcome::success(EvidenceDiff::default()), now)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::OutcomeAlreadyRecorded);
        assert_eq!(task.error_code.as_deref(), Some("EMBEDDING_TIMEOUT"));
    }

    #[test]
    fn test_finish_requires_running() {
        let now = Utc::now();
        let mut task = ReindexTask::new(ReindexScope::All, "ops", now);
        let err = task.finish(TaskOutcome::failure("X"), now).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidStateTransition);
    }

    #[test]
    fn test_matches_text() {
        let now = Utc::now();
        let mut task = ReindexTask::new(ReindexScope::sources(["filings"]).unwrap(), "Dana", now);
        task.start(now).unwrap();
        task.finish(TaskOutcome::failure("EMBEDDING_TIMEOUT"), now).unwrap();

        assert!(task.matches_text("dana"));
        assert!(task.matches_text("FIL"));
        assert!(task.matches_text("embedding"));
        assert!(!task.matches_text("news"));
        assert!(task.matches_text("  "));
    }
}
