//! Error handling for the reindex engine.
//!
//! This module provides:
//! - A single error type carrying a stable, machine-readable [`ErrorCode`]
//! - HTTP status mapping for API responses
//! - User-facing messages kept apart from internal diagnostics
//! - Severity-driven logging and an error counter
//!
//! # Usage
//!
//! ```rust,ignore
//! use reindex_core::error::{ReindexError, Result};
//!
//! fn append(path: &Path, line: &str) -> Result<()> {
//!     write_line(path, line).map_err(|e| ReindexError::audit_write(path, e))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{error, warn};

use crate::jobs::task::{TaskId, TaskStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for reindex operations.
pub type Result<T> = std::result::Result<T, ReindexError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable; clients branch on them rather than on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Task Errors (1000-1099)
    TaskNotFound,
    InvalidScope,
    ScopeBusy,
    InvalidStateTransition,
    OutcomeAlreadyRecorded,

    // Retry Queue Errors (1100-1199)
    QueueEntryNotFound,
    NotEligible,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Audit Errors (2300-2399)
    AuditWriteFailed,
    AuditReadFailed,

    // Validation Errors (4100-4199)
    ValidationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::TaskNotFound => 1000,
            Self::InvalidScope => 1001,
            Self::ScopeBusy => 1002,
            Self::InvalidStateTransition => 1003,
            Self::OutcomeAlreadyRecorded => 1004,

            Self::QueueEntryNotFound => 1100,
            Self::NotEligible => 1101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::AuditWriteFailed => 2300,
            Self::AuditReadFailed => 2301,

            Self::ValidationError => 4100,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Not Found (404)
            Self::TaskNotFound | Self::QueueEntryNotFound => StatusCode::NOT_FOUND,

            // Bad Request (400)
            Self::InvalidScope
            | Self::ValidationError
            | Self::DeserializationError
            | Self::InvalidJson => StatusCode::BAD_REQUEST,

            // Conflict (409)
            Self::ScopeBusy
            | Self::NotEligible
            | Self::InvalidStateTransition
            | Self::OutcomeAlreadyRecorded => StatusCode::CONFLICT,

            // Internal Server Error (500)
            Self::SerializationError
            | Self::AuditWriteFailed
            | Self::AuditReadFailed
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    ///
    /// A busy scope clears once the running task reaches a terminal state.
    /// Execution failures are task outcomes, not errors; the retry queue
    /// absorbs them.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ScopeBusy)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "task",
            1100..=1199 => "retry_queue",
            2200..=2299 => "serialization",
            2300..=2399 => "audit",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors and expected contention
    Low,
    /// Degraded bookkeeping that the engine survives
    Medium,
    /// Bookkeeping faults that indicate a scheduling bug
    High,
    /// The engine cannot make progress
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::TaskNotFound
            | ErrorCode::InvalidScope
            | ErrorCode::ScopeBusy
            | ErrorCode::QueueEntryNotFound
            | ErrorCode::NotEligible
            | ErrorCode::ValidationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson => Self::Low,

            ErrorCode::AuditWriteFailed => Self::Medium,

            ErrorCode::InvalidStateTransition
            | ErrorCode::OutcomeAlreadyRecorded
            | ErrorCode::SerializationError
            | ErrorCode::AuditReadFailed
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (task, queue entry)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Seconds until the request may succeed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.retry_after_secs.is_none()
            && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the reindex engine.
#[derive(Error, Debug)]
pub struct ReindexError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ReindexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ReindexError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "reindex_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&ReindexError> for ErrorResponse {
    fn from(error: &ReindexError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for ReindexError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for ReindexError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for ReindexError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ReindexError>() {
            Ok(reindex_error) => reindex_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for ReindexError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl ReindexError {
    // ─────────────────────────────────────────────────────────────────────────
    // Task Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a task not found error.
    pub fn task_not_found(task_id: TaskId) -> Self {
        Self::new(ErrorCode::TaskNotFound, format!("Task not found: {}", task_id))
            .with_details(ErrorDetails::new().with_entity("task", task_id.to_string()))
    }

    /// Create an invalid scope error.
    pub fn invalid_scope(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidScope,
            format!("Invalid scope: {}", reason.into()),
        )
    }

    /// A task with an overlapping scope is already active.
    pub fn scope_busy(scope: impl Into<String>, active_task: TaskId) -> Self {
        let scope = scope.into();
        Self::new(
            ErrorCode::ScopeBusy,
            format!("Scope '{}' overlaps an active reindex task", scope),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("task", active_task.to_string())
                .with_context("scope", scope)
                .with_suggestion("Wait for the active task to finish"),
        )
    }

    /// Create an invalid state transition error.
    pub fn invalid_state_transition(task_id: TaskId, from: TaskStatus, to: TaskStatus) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid task state transition: {} -> {}", from, to),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("task", task_id.to_string())
                .with_context("from_state", from.to_string())
                .with_context("to_state", to.to_string()),
        )
    }

    /// An outcome arrived for a task that already reached a terminal state.
    pub fn outcome_already_recorded(task_id: TaskId, status: TaskStatus) -> Self {
        Self::new(
            ErrorCode::OutcomeAlreadyRecorded,
            format!("Task {} already finished with status {}", task_id, status),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("task", task_id.to_string())
                .with_context("status", status.to_string()),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Retry Queue Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a queue entry not found error.
    pub fn queue_entry_not_found(queue_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::QueueEntryNotFound,
            format!("Queue entry not found: {}", queue_id),
        )
        .with_details(ErrorDetails::new().with_entity("queue_entry", queue_id.to_string()))
    }

    /// The entry is not eligible for retry and the caller did not force it.
    pub fn not_eligible(queue_id: impl fmt::Display, reason: &str, retry_after_secs: Option<u64>) -> Self {
        let mut details = ErrorDetails::new()
            .with_entity("queue_entry", queue_id.to_string())
            .with_context("reason", reason)
            .with_suggestion("Wait for the cooldown or force a manual retry");
        if let Some(secs) = retry_after_secs {
            details = details.with_retry_after(secs);
        }
        Self::new(
            ErrorCode::NotEligible,
            format!("Queue entry {} is not eligible for retry: {}", queue_id, reason),
        )
        .with_details(details)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Audit Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Opening or appending to the audit file failed.
    pub fn audit_write(path: &Path, error: std::io::Error) -> Self {
        Self::with_internal(
            ErrorCode::AuditWriteFailed,
            "Failed to write audit record",
            format!("{}: {}", path.display(), error),
        )
        .with_source(error)
    }

    /// Reading the audit file back for export failed.
    pub fn audit_read(path: &Path, error: std::io::Error) -> Self {
        Self::with_internal(
            ErrorCode::AuditReadFailed,
            "Failed to read audit trail",
            format!("{}: {}", path.display(), error),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
