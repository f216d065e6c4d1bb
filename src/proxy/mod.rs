// Proxy module - HTTP server that fronts the backend runtime
//
// The router pins the admin/debug/health surface (bare and /v1-prefixed),
// then catches everything else with the proxy handler, which forwards
// OpenAI-compatible calls to the backend. The access filter wraps the whole
// router, so no handler runs for a rejected source or a bad key.

mod error;
mod handlers;
mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use tokio::net::TcpListener;

use crate::access::{access_middleware, AccessFilter};
use crate::config::Config;
use crate::{admin, debug};

pub use handlers::proxy_handler;
pub use state::GatewayState;

/// Build the gateway router with the access filter applied to every route
pub fn build_router(state: GatewayState, filter: Arc<AccessFilter>) -> Router {
    // The admin/debug/health surface is reachable both bare and under /v1,
    // since /v1/{admin,debug,health} are excluded from proxying
    Router::new()
        .route("/health", get(debug::health))
        .route("/v1/health", get(debug::health))
        // Model management endpoints
        .route("/admin/models", get(admin::list_models))
        .route("/admin/models/load", post(admin::load_model))
        .route("/admin/models/unload", post(admin::unload_model))
        .route("/admin/models/activate", post(admin::activate_model))
        .route("/v1/admin/models", get(admin::list_models))
        .route("/v1/admin/models/load", post(admin::load_model))
        .route("/v1/admin/models/unload", post(admin::unload_model))
        .route("/v1/admin/models/activate", post(admin::activate_model))
        // Observability endpoints
        .route("/debug/status", get(debug::status))
        .route("/debug/metrics", get(debug::metrics))
        .route("/debug/stream", get(debug::stream))
        .route("/v1/debug/status", get(debug::status))
        .route("/v1/debug/metrics", get(debug::metrics))
        .route("/v1/debug/stream", get(debug::stream))
        // Proxy handler (catch-all)
        .route("/*path", any(proxy_handler))
        .layer(middleware::from_fn_with_state(filter, access_middleware))
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves
pub async fn serve(
    config: &Config,
    state: GatewayState,
    filter: Arc<AccessFilter>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state, filter);
    let bind_addr = config.bind_addr();

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Gateway listening on {}", bind_addr);

    // Graceful shutdown: stop accepting, let in-flight requests finish
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Server error")?;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::control::ControlClient;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::extract::connect_info::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router(config: Config) -> Router {
        let state = GatewayState::new(
            &config,
            EventBus::new(),
            AppState::shared(),
            Arc::new(ControlClient::new(config.control_url.clone())),
        )
        .unwrap();
        let filter = Arc::new(AccessFilter::from_config(&config).unwrap());
        build_router(state, filter)
    }

    fn request_from(peer: &str, path: &str) -> Request<Body> {
        let mut req = Request::builder().uri(path).body(Body::empty()).unwrap();
        // Normally injected by into_make_service_with_connect_info
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>(peer.parse().unwrap()));
        req
    }

    #[tokio::test]
    async fn health_answers_without_auth_by_default() {
        let config = Config {
            shared_secret: "s3cret".into(),
            ..Config::default()
        };
        let router = test_router(config);

        let response = router
            .oneshot(request_from("192.168.1.5:40000", "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert!(value.get("uptime_seconds").is_some());
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized_when_secret_set() {
        let config = Config {
            shared_secret: "s3cret".into(),
            ..Config::default()
        };
        let router = test_router(config);

        let response = router
            .oneshot(request_from("192.168.1.5:40000", "/admin/models"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn disallowed_source_is_forbidden_before_anything_else() {
        let config = Config {
            allowlist: vec!["10.0.0.0/8".into()],
            ..Config::default()
        };
        let router = test_router(config);

        let response = router
            .oneshot(request_from("192.168.1.5:40000", "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unmatched_routes_are_not_found() {
        let router = test_router(Config::default());

        let response = router
            .oneshot(request_from("192.168.1.5:40000", "/v2/whatever"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn debug_status_reports_idle_state() {
        let router = test_router(Config::default());

        let response = router
            .oneshot(request_from("192.168.1.5:40000", "/debug/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "idle");
        assert_eq!(value["total_requests"], 0);
        assert!(value["active_model"]["model_key"].is_null());
    }

    #[tokio::test]
    async fn v1_prefixed_debug_surface_is_not_proxied() {
        let router = test_router(Config::default());

        let response = router
            .oneshot(request_from("192.168.1.5:40000", "/v1/debug/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value.get("performance").is_some());
        assert!(value.get("system").is_some());
    }
}
