//! HTTP API for the reindex engine.
//!
//! Routes are served both at the root (`/reindex/...`) and under `/api/v1`.
//! Errors are rendered by the `IntoResponse` impl on `ReindexError`.

mod handlers;
pub mod middleware;
pub mod v1;

use axum::{middleware as axum_middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::jobs::engine::ReindexEngine;
use crate::observability::MetricsRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReindexEngine>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(engine: Arc<ReindexEngine>) -> Self {
        Self {
            engine,
            metrics: MetricsRegistry::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Build the API router.
///
/// - `GET /health` and `GET /metrics` (unversioned)
/// - reindex routes at the root and under `/api/v1/`
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .merge(v1::routes::v1_router())
        .nest(v1::routes::V1_PREFIX, v1::routes::v1_router())
        .layer(axum_middleware::from_fn(middleware::api_version_headers))
        .layer(axum_middleware::from_fn(middleware::content_type_validation))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Standard API response envelope.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: Some(code.into()),
        }
    }

    pub fn from_error(err: &crate::error::ReindexError) -> Self {
        Self::error_with_code(err.user_message(), err.code().to_string())
    }
}
