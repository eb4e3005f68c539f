//! Request middleware: content-type enforcement and response headers.

use axum::{
    extract::Request,
    http::{
        header::{HeaderName, HeaderValue, CONTENT_TYPE},
        Method, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use super::ApiResponse;

/// Header carrying the request id, echoed back on every response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Reject POST/PUT/PATCH bodies that are not JSON.
pub async fn content_type_validation(req: Request, next: Next) -> Response {
    if matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH) {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());

        let (message, code) = match content_type {
            Some(ct) if ct.contains("application/json") => return next.run(req).await,
            Some(_) => ("Content-Type must be application/json", "UNSUPPORTED_MEDIA_TYPE"),
            None => ("Content-Type header is required for this request", "MISSING_CONTENT_TYPE"),
        };

        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(ApiResponse::<()>::error_with_code(message, code)),
        )
            .into_response();
    }
    next.run(req).await
}

/// Echo or assign a request id and stamp the API version.
pub async fn api_version_headers(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-api-version"),
        HeaderValue::from_static("1.0"),
    );
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), val);
    }

    response
}

/// Split a `status=a,b` query value into trimmed, non-empty parts.
pub fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
