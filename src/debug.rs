// Debug surface - status, metrics, and the live SSE event stream
//
// /debug/stream is where the event bus meets the wire: each subscriber gets
// a synthetic `connected` event, then every bus frame in publish order, with
// SSE comment keep-alives whenever 30 seconds pass without traffic.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, Response},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use tokio::time::MissedTickBehavior;

use crate::metrics;
use crate::proxy::GatewayState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// GET /health
pub async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let uptime = state.app.lock().unwrap().uptime_seconds();
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_seconds": uptime,
    }))
}

/// GET /debug/status - snapshot of the gateway state
pub async fn status(State(state): State<GatewayState>) -> impl IntoResponse {
    let snapshot = state.app.lock().unwrap().status_snapshot();
    Json(snapshot)
}

/// GET /debug/metrics - derived metrics, computed per query
pub async fn metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    let metrics = {
        let app = state.app.lock().unwrap();
        metrics::compute(&app, &state.bus)
    };
    Json(metrics)
}

/// GET /debug/stream - live SSE feed of gateway and backend events
pub async fn stream(State(state): State<GatewayState>) -> Response<Body> {
    let mut subscriber = state.bus.subscribe();

    let stream = async_stream::stream! {
        let connected = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "message": "Debug stream connected",
        });
        yield Ok::<Bytes, Infallible>(Bytes::from(format!(
            "event: connected\ndata: {connected}\n\n"
        )));

        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval's first tick fires immediately; push it out a full period
        keep_alive.reset();

        loop {
            tokio::select! {
                frame = subscriber.recv() => {
                    match frame {
                        Some(frame) => {
                            yield Ok(Bytes::from(frame.to_sse()));
                            keep_alive.reset();
                        }
                        None => break,
                    }
                }
                _ = keep_alive.tick() => {
                    yield Ok(Bytes::from_static(b": keep-alive\n\n"));
                }
            }
        }
        // Dropping the subscriber (moved into this stream) unregisters it
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
