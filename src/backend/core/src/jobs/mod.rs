//! Reindex job engine.
//!
//! - **Registry**: canonical task state, scope locking, and history
//! - **Retry Queue**: failed scopes awaiting retry, with cooldowns and modes
//! - **Runner**: the seam that performs the actual reindex
//! - **Scheduler**: automatic retries and the execution watchdog
//!
//! ```text
//!  submit ──▶ JobRegistry ──▶ ExecutionRunner ──▶ record_outcome
//!                 ▲                                   │ failed
//!                 │ retry                             ▼
//!           RetryScheduler ◀──────────────────── RetryQueue
//! ```

pub mod clock;
pub mod cooldown;
pub mod engine;
pub mod evidence;
pub mod history;
pub mod registry;
pub mod retry_queue;
pub mod runner;
pub mod scheduler;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::CooldownPolicy;
pub use engine::{
    EngineBuilder, EngineStats, ReindexEngine, RetryCommand, SubmitCommand, TickReport,
    SCHEDULER_ACTOR,
};
pub use evidence::{DiffType, EvidenceDiff, EvidenceSample, EvidenceTracker};
pub use history::{HistoryEvent, HistoryFilter, TaskHistory};
pub use registry::JobRegistry;
pub use retry_queue::{
    MutationKind, QueueEntry, QueueEntryView, QueueFilter, QueueId, QueueMutation, QueueStatus,
    RetryMode, RetryQueue, RetryState,
};
pub use runner::{ExecutionRunner, NoopRunner, RunRequest, ScriptedRunner};
pub use scheduler::{RetryScheduler, SchedulerHandle, SchedulerStats};
pub use task::{ReindexScope, ReindexTask, TaskId, TaskOutcome, TaskStatus, TIMEOUT_ERROR_CODE};
