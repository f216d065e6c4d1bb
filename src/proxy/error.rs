//! Proxy error types and response handling

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};

/// Errors that can occur during proxying
#[derive(Debug)]
pub(crate) enum ProxyError {
    BodyRead(String),
    /// No route matched; the path is neither /v1/* nor a known shorthand
    RouteNotFound,
    ResponseBuild(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            ProxyError::BodyRead(msg) => (StatusCode::BAD_REQUEST, msg),
            ProxyError::RouteNotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            ProxyError::ResponseBuild(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status != StatusCode::NOT_FOUND {
            tracing::error!("Proxy error: {} - {}", status, message);
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
