// Admin surface - model lifecycle endpoints
//
// These handlers bridge HTTP to the control channel: list models, load and
// unload them, and set the active model the proxy augments requests with.
// Every mutation publishes lifecycle events so /debug/stream subscribers see
// the same story the caller does.

use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::control::{ControlError, LoadConfig};
use crate::events::GatewayEvent;
use crate::proxy::GatewayState;
use crate::state::{ActiveModel, GatewayStatus, InferenceDefaults, OperationKind};

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub model_key: String,
    pub instance_id: Option<String>,
    pub load_config: Option<LoadConfig>,
    pub default_inference: Option<InferenceDefaults>,
    #[serde(default = "default_true")]
    pub activate: bool,
}

#[derive(Debug, Deserialize)]
pub struct UnloadRequest {
    pub model_key: String,
    pub instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub model_key: String,
    pub instance_id: Option<String>,
    pub default_inference: Option<InferenceDefaults>,
}

fn default_true() -> bool {
    true
}

/// 400 with the structured details list
fn validation_failure(details: Vec<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Validation failed", "details": details })),
    )
        .into_response()
}

/// Map a control failure to its HTTP status
fn control_failure_status(error: &ControlError) -> StatusCode {
    match error {
        ControlError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /admin/models - loaded and downloaded model listings
pub async fn list_models(State(state): State<GatewayState>) -> Response {
    match state.control.list_models().await {
        Ok((loaded, downloaded)) => {
            Json(json!({ "loaded": loaded, "downloaded": downloaded })).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "model listing failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// POST /admin/models/load - load a model, optionally activating it
pub async fn load_model(
    State(state): State<GatewayState>,
    Json(req): Json<LoadRequest>,
) -> Response {
    let mut details = Vec::new();
    if req.model_key.trim().is_empty() {
        details.push("model_key must not be empty".to_string());
    }
    if let Some(config) = &req.load_config {
        details.extend(config.validation_errors());
    }
    if let Some(defaults) = &req.default_inference {
        details.extend(defaults.validation_errors());
    }
    if !details.is_empty() {
        return validation_failure(details);
    }

    let start = Instant::now();
    state.bus.publish(&GatewayEvent::ModelLoadStart {
        model_key: req.model_key.clone(),
        instance_id: req.instance_id.clone(),
    });
    {
        let mut app = state.app.lock().unwrap();
        app.status = GatewayStatus::LoadingModel;
        app.begin_operation(OperationKind::Load, Some(req.model_key.clone()), Some(0.0));
    }

    let result = state
        .control
        .load_model(
            &req.model_key,
            req.instance_id.as_deref(),
            req.load_config.as_ref(),
            |progress| {
                state.bus.publish(&GatewayEvent::ModelLoadProgress {
                    model_key: req.model_key.clone(),
                    progress,
                });
                if let Some(op) = state.app.lock().unwrap().current_operation.as_mut() {
                    op.progress = Some(progress);
                }
            },
        )
        .await;
    let elapsed = start.elapsed().as_millis() as u64;

    match result {
        Ok(()) => {
            {
                let mut app = state.app.lock().unwrap();
                if req.activate {
                    app.active_model = ActiveModel {
                        model_key: Some(req.model_key.clone()),
                        instance_id: req.instance_id.clone(),
                        default_inference: req.default_inference.clone().unwrap_or_default(),
                    };
                }
                app.clear_operation();
                app.status = GatewayStatus::Idle;
            }
            state.bus.publish(&GatewayEvent::ModelLoadComplete {
                model_key: req.model_key.clone(),
                instance_id: req.instance_id.clone(),
                total_time_ms: elapsed,
            });
            tracing::info!(model_key = %req.model_key, elapsed_ms = elapsed, "model loaded");

            Json(json!({
                "status": "loaded",
                "model_key": req.model_key,
                "instance_id": req.instance_id,
                "activated": req.activate,
                "total_time_ms": elapsed,
                "message": format!("Model {} loaded", req.model_key),
            }))
            .into_response()
        }
        Err(e) => {
            {
                let mut app = state.app.lock().unwrap();
                app.clear_operation();
                app.status = GatewayStatus::Error;
                app.total_errors += 1;
            }
            state.bus.publish(&GatewayEvent::Error {
                request_id: None,
                error: e.to_string(),
                total_time_ms: Some(elapsed),
            });
            tracing::error!(model_key = %req.model_key, error = %e, "model load failed");

            // Load failures are always 500, whatever the control error was
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// POST /admin/models/unload - unload a model, clearing it if active
pub async fn unload_model(
    State(state): State<GatewayState>,
    Json(req): Json<UnloadRequest>,
) -> Response {
    if req.model_key.trim().is_empty() && req.instance_id.is_none() {
        return validation_failure(vec!["model_key must not be empty".to_string()]);
    }

    let start = Instant::now();
    state.bus.publish(&GatewayEvent::ModelUnloadStart {
        model_key: req.model_key.clone(),
    });
    {
        let mut app = state.app.lock().unwrap();
        app.begin_operation(OperationKind::Unload, Some(req.model_key.clone()), None);
    }

    let result = state
        .control
        .unload_model(&req.model_key, req.instance_id.as_deref())
        .await;
    let elapsed = start.elapsed().as_millis() as u64;

    match result {
        Ok(identifier) => {
            {
                let mut app = state.app.lock().unwrap();
                if app.active_model.matches(&req.model_key, Some(&identifier)) {
                    app.active_model = ActiveModel::default();
                }
                app.clear_operation();
            }
            state.bus.publish(&GatewayEvent::ModelUnloadComplete {
                model_key: req.model_key.clone(),
                total_time_ms: elapsed,
            });
            tracing::info!(model_key = %req.model_key, elapsed_ms = elapsed, "model unloaded");

            Json(json!({
                "status": "unloaded",
                "model_key": req.model_key,
                "instance_id": identifier,
                "total_time_ms": elapsed,
            }))
            .into_response()
        }
        Err(e) if e.is_not_found() => {
            state.app.lock().unwrap().clear_operation();
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "status": "not_found", "message": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => {
            {
                let mut app = state.app.lock().unwrap();
                app.clear_operation();
                app.total_errors += 1;
            }
            state.bus.publish(&GatewayEvent::Error {
                request_id: None,
                error: e.to_string(),
                total_time_ms: Some(elapsed),
            });
            tracing::error!(model_key = %req.model_key, error = %e, "model unload failed");

            (
                control_failure_status(&e),
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// POST /admin/models/activate - set the active model without a backend call
pub async fn activate_model(
    State(state): State<GatewayState>,
    Json(req): Json<ActivateRequest>,
) -> Response {
    let mut details = Vec::new();
    if req.model_key.trim().is_empty() {
        details.push("model_key must not be empty".to_string());
    }
    if let Some(defaults) = &req.default_inference {
        details.extend(defaults.validation_errors());
    }
    if !details.is_empty() {
        return validation_failure(details);
    }

    {
        let mut app = state.app.lock().unwrap();
        app.active_model = ActiveModel {
            model_key: Some(req.model_key.clone()),
            instance_id: req.instance_id.clone(),
            default_inference: req.default_inference.clone().unwrap_or_default(),
        };
    }
    state.bus.publish(&GatewayEvent::ModelActivate {
        model_key: req.model_key.clone(),
        instance_id: req.instance_id.clone(),
    });
    tracing::info!(model_key = %req.model_key, "model activated");

    Json(json!({
        "status": "activated",
        "model_key": req.model_key,
        "instance_id": req.instance_id,
    }))
    .into_response()
}
