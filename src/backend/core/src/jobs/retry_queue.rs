//! Retry queue for failed reindex tasks.
//!
//! One [`QueueEntry`] exists per failing scope (keyed by the canonical scope
//! label). Entries track attempts, cooldown and retry mode; the engine claims
//! them before resubmitting and resolves or fails them when the retried task
//! finishes.
//!
//! # Invariants
//!
//! - In `auto` mode `attempts <= max_attempts`; at equality the entry is
//!   auto-exhausted and only a forced retry proceeds.
//! - `cooldown_until` is `None` once elapsed.
//! - Queue ids are random UUIDs and are never reused.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::error::{ReindexError, Result};
use crate::jobs::cooldown::CooldownPolicy;
use crate::jobs::task::{ReindexScope, ReindexTask, TaskId, TaskStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Identification and Enums
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(pub Uuid);

impl QueueId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for QueueId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Queue-local status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for its first retry
    Queued,
    /// A retry task is in flight
    Running,
    /// The last retry failed
    Failed,
    /// The retry succeeded; only seen in the audit record of the removal
    Completed,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 4] = [Self::Queued, Self::Running, Self::Failed, Self::Completed];
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = ReindexError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ReindexError::validation(format!("Unknown queue status: {}", s)))
    }
}

/// Who decides when an entry is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// The scheduler retries under the cooldown and attempt budget
    #[default]
    Auto,
    /// Only an operator retries; counters are advisory
    Manual,
}

impl fmt::Display for RetryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Operator-facing retry state derived from an entry and the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    Eligible,
    CoolingDown,
    AutoExhausted,
    InFlight,
    Manual,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry bookkeeping for one failing scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_id: QueueId,
    /// Task whose failure created this entry
    pub original_task_id: TaskId,
    /// Retry task currently in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
    /// Most recent task that failed for this scope
    pub last_task_id: TaskId,
    pub scope: ReindexScope,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub retry_mode: RetryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Whether a retry may start now.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.status == QueueStatus::Running {
            return false;
        }
        match self.retry_mode {
            RetryMode::Manual => true,
            RetryMode::Auto => {
                self.attempts < self.max_attempts
                    && self.cooldown_until.map_or(true, |until| now >= until)
            }
        }
    }

    pub fn is_auto_exhausted(&self) -> bool {
        self.retry_mode == RetryMode::Auto && self.attempts >= self.max_attempts
    }

    pub fn retry_state(&self, now: DateTime<Utc>) -> RetryState {
        if self.status == QueueStatus::Running {
            RetryState::InFlight
        } else if self.retry_mode == RetryMode::Manual {
            RetryState::Manual
        } else if self.is_auto_exhausted() {
            RetryState::AutoExhausted
        } else if self.is_eligible(now) {
            RetryState::Eligible
        } else {
            RetryState::CoolingDown
        }
    }

    /// Automatic attempts left; `None` in manual mode.
    pub fn attempts_remaining(&self) -> Option<u32> {
        match self.retry_mode {
            RetryMode::Auto => Some(self.max_attempts.saturating_sub(self.attempts)),
            RetryMode::Manual => None,
        }
    }

    /// Sort key for listings.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    pub fn matches_text(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.scope.matches_text(&needle)
            || self
                .last_error
                .as_deref()
                .is_some_and(|e| e.to_lowercase().contains(&needle))
            || self
                .note
                .as_deref()
                .is_some_and(|n| n.to_lowercase().contains(&needle))
    }

    /// Snapshot with derived fields for API responses.
    pub fn view(&self, now: DateTime<Utc>) -> QueueEntryView {
        QueueEntryView {
            entry: self.clone(),
            retry_state: self.retry_state(now),
            eligible: self.is_eligible(now),
            attempts_remaining: self.attempts_remaining(),
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }
}

/// A queue entry plus the derived state operators see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntryView {
    #[serde(flatten)]
    pub entry: QueueEntry,
    pub retry_state: RetryState,
    pub eligible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
}

/// Filter for queue listings. An empty status set matches every status.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub statuses: HashSet<QueueStatus>,
    pub search: Option<String>,
}

impl QueueFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: QueueStatus) -> Self {
        self.statuses.insert(status);
        self
    }

    pub fn with_search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&entry.status))
            && self.search.as_deref().map_or(true, |q| entry.matches_text(q))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Mutations
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of change applied to a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// First failure of a scope
    Created,
    /// Repeated failure or retry failure
    Updated,
    /// A retry was claimed
    Claimed,
    /// A claim was rolled back because the retry could not start
    Released,
    ModeChanged,
    /// Retry succeeded and the entry was dropped
    Resolved,
    /// Dismissed by an operator
    Removed,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Claimed => "claimed",
            Self::Released => "released",
            Self::ModeChanged => "mode_changed",
            Self::Resolved => "resolved",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Snapshot of an entry after a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMutation {
    pub kind: MutationKind,
    pub entry: QueueEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl QueueMutation {
    fn new(kind: MutationKind, entry: &QueueEntry, actor: Option<&str>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            entry: entry.clone(),
            actor: actor.map(str::to_string),
            timestamp,
        }
    }
}

/// A successful claim. Pass it back to [`RetryQueue::release`] to roll back.
#[derive(Debug, Clone)]
pub struct Claim {
    pub entry: QueueEntry,
    /// Mutations produced by the claim, in order
    pub mutations: Vec<QueueMutation>,
    previous: QueueEntry,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Queue
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<QueueId, QueueEntry>,
    by_scope: HashMap<String, QueueId>,
}

impl QueueState {
    fn entry_mut(&mut self, queue_id: QueueId) -> Result<&mut QueueEntry> {
        self.entries
            .get_mut(&queue_id)
            .ok_or_else(|| ReindexError::queue_entry_not_found(queue_id))
    }

    fn take(&mut self, queue_id: QueueId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&queue_id)?;
        let label = entry.scope.label();
        if self.by_scope.get(&label) == Some(&queue_id) {
            self.by_scope.remove(&label);
        }
        Some(entry)
    }
}

/// Retry queue manager.
#[derive(Debug)]
pub struct RetryQueue {
    state: Mutex<QueueState>,
    policy: CooldownPolicy,
    max_attempts: u32,
}

impl RetryQueue {
    pub fn new(policy: CooldownPolicy, max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            policy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn policy(&self) -> &CooldownPolicy {
        &self.policy
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn cooldown_after(&self, entry: &QueueEntry, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if entry.retry_mode == RetryMode::Auto && entry.attempts < entry.max_attempts {
            Some(self.policy.cooldown_until(entry.attempts, from))
        } else {
            None
        }
    }

    /// Record a failed task.
    ///
    /// Creates an entry with `attempts = 0`, or updates the existing entry for
    /// the same scope label with the new error and attempt time.
    pub fn enqueue(
        &self,
        failed: &ReindexTask,
        retry_mode: RetryMode,
        now: DateTime<Utc>,
    ) -> Result<QueueMutation> {
        if failed.status != TaskStatus::Failed {
            return Err(ReindexError::invalid_state_transition(
                failed.task_id,
                failed.status,
                TaskStatus::Failed,
            ));
        }

        let label = failed.scope.label();
        let mut state = self.state.lock();

        if let Some(queue_id) = state.by_scope.get(&label).copied() {
            let snapshot = {
                let entry = state.entry_mut(queue_id)?;
                entry.last_error = failed.error_code.clone();
                entry.last_attempt_at = Some(now);
                entry.last_task_id = failed.task_id;
                entry.touch(now);
                entry.clone()
            };
            let until = if snapshot.status == QueueStatus::Running {
                snapshot.cooldown_until
            } else {
                self.cooldown_after(&snapshot, now)
            };
            let entry = state.entry_mut(queue_id)?;
            entry.cooldown_until = until;

            tracing::info!(
                queue_id = %queue_id,
                task_id = %failed.task_id,
                scope = %label,
                "Existing retry entry updated for repeated failure"
            );
            return Ok(QueueMutation::new(MutationKind::Updated, entry, None, now));
        }

        let mut entry = QueueEntry {
            queue_id: QueueId::new(),
            original_task_id: failed.task_id,
            current_task_id: None,
            last_task_id: failed.task_id,
            scope: failed.scope.clone(),
            status: QueueStatus::Queued,
            attempts: 0,
            max_attempts: self.max_attempts,
            retry_mode,
            cooldown_until: None,
            last_attempt_at: Some(now),
            last_error: failed.error_code.clone(),
            note: failed.note.clone(),
            created_at: now,
            updated_at: None,
        };
        entry.cooldown_until = self.cooldown_after(&entry, now);

        tracing::info!(
            queue_id = %entry.queue_id,
            task_id = %failed.task_id,
            scope = %label,
            cooldown_until = ?entry.cooldown_until,
            "Retry entry created"
        );

        let mutation = QueueMutation::new(MutationKind::Created, &entry, None, now);
        state.by_scope.insert(label, entry.queue_id);
        state.entries.insert(entry.queue_id, entry);
        Ok(mutation)
    }

    /// Claim an entry for a retry (`queued | failed -> running`).
    ///
    /// Ineligible entries are rejected unless `force` is set. A forced claim
    /// of a cooling-down auto entry spends one auto attempt early; forcing an
    /// auto-exhausted entry hands it to the operator by switching it to
    /// manual mode. An entry that is already running is never claimed.
    /// `note` replaces the entry's note when given.
    pub fn claim(
        &self,
        queue_id: QueueId,
        actor: &str,
        note: Option<&str>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Claim> {
        let mut state = self.state.lock();
        let entry = state.entry_mut(queue_id)?;

        if entry.status == QueueStatus::Running {
            return Err(ReindexError::not_eligible(queue_id, "a retry is already running", None));
        }
        if entry.cooldown_until.is_some_and(|until| now >= until) {
            entry.cooldown_until = None;
        }

        let previous = entry.clone();
        let mut mutations = Vec::new();

        if !entry.is_eligible(now) {
            if !force {
                return Err(match entry.cooldown_until {
                    Some(until) if !entry.is_auto_exhausted() => {
                        let wait = (until - now).num_seconds().max(1) as u64;
                        ReindexError::not_eligible(queue_id, "cooling down", Some(wait))
                    }
                    _ => ReindexError::not_eligible(queue_id, "automatic attempts exhausted", None),
                });
            }
            if entry.is_auto_exhausted() {
                entry.retry_mode = RetryMode::Manual;
                entry.touch(now);
                mutations.push(QueueMutation::new(MutationKind::ModeChanged, entry, Some(actor), now));
            }
        }

        if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
            entry.note = Some(note.to_string());
        }
        entry.attempts = entry.attempts.saturating_add(1);
        entry.status = QueueStatus::Running;
        entry.cooldown_until = None;
        entry.last_attempt_at = Some(now);
        entry.touch(now);
        mutations.push(QueueMutation::new(MutationKind::Claimed, entry, Some(actor), now));

        tracing::info!(
            queue_id = %queue_id,
            attempts = entry.attempts,
            max_attempts = entry.max_attempts,
            retry_mode = %entry.retry_mode,
            actor = %actor,
            forced = force,
            "Retry entry claimed"
        );

        Ok(Claim {
            entry: entry.clone(),
            mutations,
            previous,
        })
    }

    /// Link the retry task that a claim started.
    pub fn attach_task(&self, queue_id: QueueId, task_id: TaskId) -> Result<()> {
        let mut state = self.state.lock();
        state.entry_mut(queue_id)?.current_task_id = Some(task_id);
        Ok(())
    }

    /// Roll a claim back after the retry failed to start.
    pub fn release(&self, claim: Claim, now: DateTime<Utc>) -> Option<QueueMutation> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&claim.previous.queue_id)?;
        *entry = claim.previous;
        entry.touch(now);
        Some(QueueMutation::new(MutationKind::Released, entry, None, now))
    }

    /// The retried task failed: wait for the next window or mark exhausted.
    pub fn record_retry_failure(&self, queue_id: QueueId, failed: &ReindexTask, now: DateTime<Utc>) -> Result<QueueMutation> {
        let mut state = self.state.lock();
        let snapshot = {
            let entry = state.entry_mut(queue_id)?;
            entry.status = QueueStatus::Failed;
            entry.current_task_id = None;
            entry.last_task_id = failed.task_id;
            entry.last_error = failed.error_code.clone();
            entry.last_attempt_at = Some(now);
            entry.touch(now);
            entry.clone()
        };
        let until = self.cooldown_after(&snapshot, now);
        let entry = state.entry_mut(queue_id)?;
        entry.cooldown_until = until;

        if entry.is_auto_exhausted() {
            tracing::warn!(
                queue_id = %queue_id,
                attempts = entry.attempts,
                scope = %entry.scope,
                "Automatic retries exhausted; manual retry required"
            );
        } else {
            tracing::info!(
                queue_id = %queue_id,
                attempts = entry.attempts,
                cooldown_until = ?entry.cooldown_until,
                "Retry failed; waiting for next window"
            );
        }
        Ok(QueueMutation::new(MutationKind::Updated, entry, None, now))
    }

    /// The retried task succeeded: drop the entry.
    pub fn resolve(&self, queue_id: QueueId, now: DateTime<Utc>) -> Option<QueueMutation> {
        let mut entry = self.state.lock().take(queue_id)?;
        entry.status = QueueStatus::Completed;
        entry.current_task_id = None;
        entry.touch(now);
        tracing::info!(queue_id = %queue_id, scope = %entry.scope, "Retry succeeded; entry resolved");
        Some(QueueMutation::new(MutationKind::Resolved, &entry, None, now))
    }

    /// Delete an entry unconditionally. Task history is untouched.
    pub fn remove(&self, queue_id: QueueId, actor: Option<&str>, now: DateTime<Utc>) -> Result<QueueMutation> {
        let entry = self
            .state
            .lock()
            .take(queue_id)
            .ok_or_else(|| ReindexError::queue_entry_not_found(queue_id))?;
        tracing::info!(queue_id = %queue_id, actor = ?actor, "Retry entry removed");
        Ok(QueueMutation::new(MutationKind::Removed, &entry, actor, now))
    }

    /// Switch between automatic and manual retries.
    ///
    /// Returning to auto clamps advisory counters to the budget and restarts
    /// the cooldown from the last attempt.
    pub fn set_mode(&self, queue_id: QueueId, mode: RetryMode, actor: &str, now: DateTime<Utc>) -> Result<QueueMutation> {
        let mut state = self.state.lock();
        let snapshot = {
            let entry = state.entry_mut(queue_id)?;
            entry.retry_mode = mode;
            if mode == RetryMode::Auto {
                entry.attempts = entry.attempts.min(entry.max_attempts);
            }
            entry.touch(now);
            entry.clone()
        };
        let until = if snapshot.status == QueueStatus::Running {
            None
        } else {
            let from = snapshot.last_attempt_at.unwrap_or(now);
            self.cooldown_after(&snapshot, from).filter(|until| *until > now)
        };
        let entry = state.entry_mut(queue_id)?;
        entry.cooldown_until = until;

        tracing::info!(queue_id = %queue_id, retry_mode = %mode, actor = %actor, "Retry mode changed");
        Ok(QueueMutation::new(MutationKind::ModeChanged, entry, Some(actor), now))
    }

    /// Null out cooldowns that have elapsed. Returns how many were cleared.
    pub fn clear_elapsed_cooldowns(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let mut cleared = 0;
        for entry in state.entries.values_mut() {
            if entry.cooldown_until.is_some_and(|until| now >= until) {
                entry.cooldown_until = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Auto-mode entries the scheduler may retry now, oldest attempt first.
    pub fn eligible_auto(&self, now: DateTime<Utc>) -> Vec<QueueId> {
        let state = self.state.lock();
        let mut eligible: Vec<&QueueEntry> = state
            .entries
            .values()
            .filter(|e| e.retry_mode == RetryMode::Auto && e.is_eligible(now))
            .collect();
        eligible.sort_by_key(|e| e.last_touched());
        eligible.into_iter().map(|e| e.queue_id).collect()
    }

    pub fn get(&self, queue_id: QueueId) -> Result<QueueEntry> {
        self.state
            .lock()
            .entries
            .get(&queue_id)
            .cloned()
            .ok_or_else(|| ReindexError::queue_entry_not_found(queue_id))
    }

    /// Entry currently tracking the scope label, if any.
    pub fn find_by_scope(&self, scope: &ReindexScope) -> Option<QueueEntry> {
        let state = self.state.lock();
        state
            .by_scope
            .get(&scope.label())
            .and_then(|id| state.entries.get(id))
            .cloned()
    }

    /// Entries matching the filter, most recently touched first.
    pub fn list(&self, filter: &QueueFilter) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .state
            .lock()
            .entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.last_touched().cmp(&a.last_touched()));
        entries
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
