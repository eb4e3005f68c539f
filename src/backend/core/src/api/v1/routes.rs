//! V1 API routes.

use axum::{
    routing::{get, post},
    Router,
};

use crate::api::{handlers, AppState};

/// V1 API prefix.
pub const V1_PREFIX: &str = "/api/v1";

/// Build the V1 API router.
///
/// # Endpoints
///
/// ## Tasks
/// - `POST /reindex` - Submit a reindex for a scope
/// - `GET /reindex/history` - Grouped task history (`?status=&q=`)
/// - `GET /reindex/tasks/:id` - One task with its timeline
///
/// ## Retry Queue
/// - `GET /reindex/queue` - List entries (`?status=&q=`)
/// - `GET /reindex/queue/:id` - One entry with derived retry state
/// - `DELETE /reindex/queue/:id` - Dismiss an entry
/// - `POST /reindex/queue/:id/retry` - Retry an entry
/// - `POST /reindex/queue/:id/mode` - Switch between auto and manual
///
/// ## Audit
/// - `GET /reindex/audit/export` - Audit trail as NDJSON
pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/reindex", post(handlers::submit_reindex))
        .route("/reindex/history", get(handlers::list_history))
        .route("/reindex/tasks/:id", get(handlers::get_task))
        .route("/reindex/queue", get(handlers::list_queue))
        .route(
            "/reindex/queue/:id",
            get(handlers::get_queue_entry).delete(handlers::remove_queue_entry),
        )
        .route("/reindex/queue/:id/retry", post(handlers::retry_queue_entry))
        .route("/reindex/queue/:id/mode", post(handlers::set_retry_mode))
        .route("/reindex/audit/export", get(handlers::export_audit))
}

/// Route paths for clients and documentation, relative to the server root.
pub mod paths {
    pub const SUBMIT: &str = "/reindex";
    pub const HISTORY: &str = "/reindex/history";
    pub const TASK: &str = "/reindex/tasks/:id";
    pub const QUEUE: &str = "/reindex/queue";
    pub const QUEUE_ENTRY: &str = "/reindex/queue/:id";
    pub const QUEUE_RETRY: &str = "/reindex/queue/:id/retry";
    pub const QUEUE_MODE: &str = "/reindex/queue/:id/mode";
    pub const AUDIT_EXPORT: &str = "/reindex/audit/export";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_constants() {
        assert!(paths::QUEUE_RETRY.starts_with(paths::QUEUE));
        assert!(paths::HISTORY.starts_with(paths::SUBMIT));
        assert!(V1_PREFIX.starts_with("/api"));
    }
}
