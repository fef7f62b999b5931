//! Outer request-timeout middleware.
//!
//! Cancels the whole request after `api_request_timeout_sec` and returns 504.
//! The Oracle call timeout enforces DB-side cancellation; this layer bounds
//! everything else (LLM calls, retrieval, repair loops).

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Duration;

#[derive(Clone)]
pub struct RequestTimeout {
    pub duration: Duration,
}

pub async fn request_timeout_middleware(
    State(timeout): State<RequestTimeout>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match tokio::time::timeout(timeout.duration, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!("Request to {} exceeded {}s budget", path, timeout.duration.as_secs());
            (
                StatusCode::GATEWAY_TIMEOUT,
                axum::Json(serde_json::json!({
                    "code": 5040,
                    "message": format!("request exceeded {}s budget", timeout.duration.as_secs()),
                })),
            )
                .into_response()
        }
    }
}
