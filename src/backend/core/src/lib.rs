#![allow(clippy::result_large_err)]
//! # Reindex Core
//!
//! A retryable reindex job engine.
//!
//! ## Architecture
//!
//! - **Jobs**: task registry with scope locking, retry queue with cooldowns,
//!   runner seam, and the background scheduler
//! - **Audit**: append-only trail of every task event and queue mutation
//! - **API**: REST interface (Axum) for submission, history, and the queue
//! - **Observability**: structured logging, trace links, and Prometheus metrics

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod jobs;
pub mod observability;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, ReindexError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditExport, AuditLog, AuditRecord};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ReindexError, Result};
    pub use crate::jobs::{
        CooldownPolicy, EvidenceDiff, ExecutionRunner, HistoryFilter, QueueEntry, QueueEntryView,
        QueueFilter, QueueId, QueueStatus, ReindexEngine, ReindexScope, ReindexTask,
        RetryCommand, RetryMode, RetryState, SubmitCommand, TaskId, TaskOutcome, TaskStatus,
    };
    pub use crate::observability::{TraceLink, TraceLinker};
}
