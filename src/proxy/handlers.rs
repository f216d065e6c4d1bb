//! Request handlers for the proxy data plane
//!
//! The catch-all handler forwards OpenAI-compatible calls to the backend,
//! injecting the active model and its sampling defaults into completion
//! bodies that omit them. Responses relay either buffered (with token-usage
//! capture) or as a verbatim chunk stream.

use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures::StreamExt;

use crate::events::{generate_request_id, GatewayEvent, TokenUsage};
use crate::state::ActiveModel;

use super::error::ProxyError;
use super::state::GatewayState;

/// Bare OpenAI paths accepted without the /v1 prefix
const OPENAI_SHORTHANDS: &[&str] = &[
    "/chat/completions",
    "/completions",
    "/models",
    "/embeddings",
    "/images/generations",
    "/audio/transcriptions",
    "/audio/translations",
];

/// Headers never copied onto the forwarded request
///
/// x-api-key is the gateway's own credential; the rest are hop-by-hop or
/// recomputed by the HTTP client.
const EXCLUDED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "content-length",
    "x-api-key",
];

/// Map an incoming path to the backend path, or None for unmatched routes
pub(super) fn rewrite_path(path: &str) -> Option<String> {
    if path.starts_with("/v1/") {
        return Some(path.to_string());
    }
    if OPENAI_SHORTHANDS.contains(&path) {
        return Some(format!("/v1{path}"));
    }
    None
}

/// Whether this backend path gets active-model augmentation
fn is_completion_path(path: &str) -> bool {
    path == "/v1/chat/completions" || path == "/v1/completions"
}

/// Prepare the forwarded body and detect the stream flag
///
/// Completion POSTs with a JSON object body get the active model injected
/// (when `model` is absent) and unset sampling defaults copied in; client
/// fields are never overwritten. Anything else passes through untouched.
pub(super) fn prepare_body(
    method: &Method,
    path: &str,
    bytes: Bytes,
    active: &ActiveModel,
) -> (Bytes, bool) {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        return (bytes, false);
    };

    if *method == Method::POST && is_completion_path(path) {
        if let Some(obj) = value.as_object_mut() {
            if !obj.contains_key("model") {
                if let Some(id) = active.injection_id() {
                    obj.insert("model".to_string(), serde_json::json!(id));
                }
            }
            active.default_inference.apply_to(obj);
        }
        let wants_stream = value
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let bytes = serde_json::to_vec(&value).map(Bytes::from).unwrap_or(bytes);
        (bytes, wants_stream)
    } else {
        let wants_stream = value
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        (bytes, wants_stream)
    }
}

/// Main proxy handler - forwards OpenAI-compatible requests to the backend
pub async fn proxy_handler(
    State(state): State<GatewayState>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let Some(path) = rewrite_path(uri.path()) else {
        return Err(ProxyError::RouteNotFound);
    };

    let start = Instant::now();
    let request_id = generate_request_id();
    tracing::debug!(%method, path, request_id, "proxying request");

    state.bus.publish(&GatewayEvent::InferenceStart {
        request_id: request_id.clone(),
        method: method.to_string(),
        path: path.clone(),
    });
    state.app.lock().unwrap().begin_inference();

    let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            // The request still gets its terminal event
            let elapsed = start.elapsed().as_millis() as u64;
            state.bus.publish(&GatewayEvent::Error {
                request_id: Some(request_id.clone()),
                error: format!("failed to read request body: {e}"),
                total_time_ms: Some(elapsed),
            });
            let mut app = state.app.lock().unwrap();
            app.record_failure(request_id, elapsed);
            app.end_inference();
            return Err(ProxyError::BodyRead(e.to_string()));
        }
    };

    let active = state.app.lock().unwrap().active_model.clone();
    let (forward_bytes, wants_stream) = prepare_body(&method, &path, body_bytes, &active);

    // Build the forward URL, preserving the query string verbatim
    let forward_url = match uri.query() {
        Some(query) => format!("{}{}?{}", state.backend_url, path, query),
        None => format!("{}{}", state.backend_url, path),
    };

    let mut forward = state
        .client
        .request(method, &forward_url)
        .body(forward_bytes.to_vec());

    for (key, value) in headers.iter() {
        if EXCLUDED_REQUEST_HEADERS.contains(&key.as_str()) {
            continue;
        }
        forward = forward.header(key.as_str(), value.as_bytes().to_vec());
    }

    // Streaming requests run unbounded unless a stream timeout is configured
    forward = if wants_stream {
        if state.stream_timeout > Duration::ZERO {
            forward.timeout(state.stream_timeout)
        } else {
            forward
        }
    } else {
        forward.timeout(state.proxy_timeout)
    };

    let response = match forward.send().await {
        Ok(response) => response,
        Err(e) => {
            return Ok(fail_request(&state, &request_id, start, &e).into_response());
        }
    };

    if wants_stream {
        Ok(relay_stream(state, request_id, start, response))
    } else {
        Ok(relay_buffered(state, request_id, start, response).await?)
    }
}

/// Terminal handling for a request the backend never answered
fn fail_request(
    state: &GatewayState,
    request_id: &str,
    start: Instant,
    error: &reqwest::Error,
) -> impl IntoResponse {
    let elapsed = start.elapsed().as_millis() as u64;
    tracing::warn!(request_id, error = %error, "backend request failed");

    state.bus.publish(&GatewayEvent::Error {
        request_id: Some(request_id.to_string()),
        error: error.to_string(),
        total_time_ms: Some(elapsed),
    });
    {
        let mut app = state.app.lock().unwrap();
        app.record_failure(request_id.to_string(), elapsed);
        app.end_inference();
    }

    let status = if error.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({ "error": format!("Backend request failed: {error}") })),
    )
}

/// Buffered relay: read the whole response, capture usage, pass it through
async fn relay_buffered(
    state: GatewayState,
    request_id: String,
    start: Instant,
    response: reqwest::Response,
) -> Result<Response<Body>, ProxyError> {
    let status = response.status();
    let resp_headers = response.headers().clone();

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            let elapsed = start.elapsed().as_millis() as u64;
            state.bus.publish(&GatewayEvent::Error {
                request_id: Some(request_id.clone()),
                error: e.to_string(),
                total_time_ms: Some(elapsed),
            });
            let mut app = state.app.lock().unwrap();
            app.record_failure(request_id, elapsed);
            app.end_inference();
            return Ok((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": format!("Backend response failed: {e}") })),
            )
                .into_response());
        }
    };

    let elapsed = start.elapsed().as_millis() as u64;
    let token_usage = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .as_ref()
        .and_then(TokenUsage::from_response);

    state.bus.publish(&GatewayEvent::InferenceComplete {
        request_id: request_id.clone(),
        total_time_ms: elapsed,
        token_usage,
    });
    {
        let mut app = state.app.lock().unwrap();
        app.record_completion(request_id, elapsed, token_usage);
        app.end_inference();
    }

    copy_response(status, &resp_headers, Body::from(body))
}

/// Streaming relay: pipe backend chunks to the client verbatim
///
/// The guard emits the terminal event exactly once: completion when the
/// stream drains, error when the upstream fails, and "client closed" when
/// the client disconnects and axum drops the body mid-flight (which also
/// tears down the upstream stream).
fn relay_stream(
    state: GatewayState,
    request_id: String,
    start: Instant,
    response: reqwest::Response,
) -> Response<Body> {
    let status = response.status();
    let resp_headers = response.headers().clone();
    let mut upstream = response.bytes_stream();

    let stream = async_stream::stream! {
        let mut guard = StreamGuard {
            state,
            request_id,
            start,
            finished: false,
        };

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => yield Ok::<Bytes, std::convert::Infallible>(bytes),
                Err(e) => {
                    guard.fail(e.to_string());
                    return;
                }
            }
        }
        guard.complete();
    };

    match copy_response(status, &resp_headers, Body::from_stream(stream)) {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Terminal-event bookkeeping for a streaming relay
struct StreamGuard {
    state: GatewayState,
    request_id: String,
    start: Instant,
    finished: bool,
}

impl StreamGuard {
    fn complete(&mut self) {
        self.finished = true;
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.state.bus.publish(&GatewayEvent::InferenceComplete {
            request_id: self.request_id.clone(),
            total_time_ms: elapsed,
            token_usage: None,
        });
        let mut app = self.state.app.lock().unwrap();
        app.record_completion(self.request_id.clone(), elapsed, None);
        app.end_inference();
    }

    fn fail(&mut self, error: String) {
        self.finished = true;
        let elapsed = self.start.elapsed().as_millis() as u64;
        tracing::warn!(request_id = %self.request_id, error, "stream relay failed");
        self.state.bus.publish(&GatewayEvent::Error {
            request_id: Some(self.request_id.clone()),
            error,
            total_time_ms: Some(elapsed),
        });
        let mut app = self.state.app.lock().unwrap();
        app.record_failure(self.request_id.clone(), elapsed);
        app.end_inference();
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.fail("client closed".to_string());
        }
    }
}

/// Build the client-facing response from the backend's status and headers
fn copy_response(
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: Body,
) -> Result<Response<Body>, ProxyError> {
    let mut builder = Response::builder().status(status.as_u16());

    for (key, value) in headers.iter() {
        if key == "transfer-encoding" || key == "connection" {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_bytes().to_vec());
    }

    builder
        .body(body)
        .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
}
