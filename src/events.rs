// Events that flow from the gateway to SSE subscribers
//
// These events represent the request lifecycle observed by the proxy and the
// telemetry extracted from the backend's log files. Using an enum allows
// pattern matching and ensures type-safe communication between async tasks.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main event type that flows through the event bus
///
/// The serde tag doubles as the SSE `event:` name, so variants are named
/// after their wire tags (`inference_start`, `lmstudio_chat_start`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A proxied request entered the data plane
    InferenceStart {
        request_id: String,
        method: String,
        path: String,
    },

    /// A proxied request finished (buffered response sent or stream drained)
    InferenceComplete {
        request_id: String,
        total_time_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
    },

    /// A model load was requested via the admin surface
    ModelLoadStart {
        model_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
    },

    /// Load progress reported by the backend (0-100)
    ModelLoadProgress { model_key: String, progress: f64 },

    /// The backend finished loading a model
    ModelLoadComplete {
        model_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        total_time_ms: u64,
    },

    /// A model unload was requested via the admin surface
    ModelUnloadStart { model_key: String },

    /// The backend finished unloading a model
    ModelUnloadComplete {
        model_key: String,
        total_time_ms: u64,
    },

    /// The active model record was overwritten (no backend call involved)
    ModelActivate {
        model_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
    },

    /// Something failed while handling a request or admin operation
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_time_ms: Option<u64>,
    },

    /// A well-formed line from the backend's log files
    DebugLog {
        timestamp: String,
        level: String,
        message: String,
        raw: String,
    },

    /// The backend started a chat completion
    LmstudioChatStart { message: String },

    /// Sampling parameters the backend resolved for a request
    LmstudioSamplingParams {
        #[serde(flatten)]
        params: BTreeMap<String, f64>,
    },

    /// Prompt processing progress (0-100)
    LmstudioPromptProgress { progress: f64, message: String },

    /// KV-cache reuse summary for a prompt
    LmstudioCacheStats {
        reused: u64,
        total: u64,
        percentage: f64,
        prefix: u64,
        non_prefix: u64,
        message: String,
    },

    /// Generation parameters and prompt token counts
    ///
    /// The backend reports these across sibling log lines, so every field is
    /// optional and each line emits the subset it carries.
    LmstudioTokenInfo {
        #[serde(skip_serializing_if = "Option::is_none")]
        n_ctx: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        n_batch: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        n_predict: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        n_keep: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_prompt_tokens: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt_tokens_to_decode: Option<u64>,
    },

    /// The backend began prompt processing
    LmstudioProcessingStart { message: String },

    /// The tailer rolled over to a new month directory
    LmstudioMonthTransition {
        old_directory: String,
        new_directory: String,
        new_log_file: String,
    },
}

impl GatewayEvent {
    /// The wire tag of this event (matches the JSON "type" field)
    pub fn type_name(&self) -> &'static str {
        match self {
            GatewayEvent::InferenceStart { .. } => "inference_start",
            GatewayEvent::InferenceComplete { .. } => "inference_complete",
            GatewayEvent::ModelLoadStart { .. } => "model_load_start",
            GatewayEvent::ModelLoadProgress { .. } => "model_load_progress",
            GatewayEvent::ModelLoadComplete { .. } => "model_load_complete",
            GatewayEvent::ModelUnloadStart { .. } => "model_unload_start",
            GatewayEvent::ModelUnloadComplete { .. } => "model_unload_complete",
            GatewayEvent::ModelActivate { .. } => "model_activate",
            GatewayEvent::Error { .. } => "error",
            GatewayEvent::DebugLog { .. } => "debug_log",
            GatewayEvent::LmstudioChatStart { .. } => "lmstudio_chat_start",
            GatewayEvent::LmstudioSamplingParams { .. } => "lmstudio_sampling_params",
            GatewayEvent::LmstudioPromptProgress { .. } => "lmstudio_prompt_progress",
            GatewayEvent::LmstudioCacheStats { .. } => "lmstudio_cache_stats",
            GatewayEvent::LmstudioTokenInfo { .. } => "lmstudio_token_info",
            GatewayEvent::LmstudioProcessingStart { .. } => "lmstudio_processing_start",
            GatewayEvent::LmstudioMonthTransition { .. } => "lmstudio_month_transition",
        }
    }
}

/// Token usage reported by the backend in an OpenAI-style `usage` object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    /// Extract usage from a response body, if present
    ///
    /// Accepts the OpenAI field names (`prompt_tokens`, `completion_tokens`,
    /// `total_tokens`). Missing counts default to zero.
    pub fn from_response(body: &serde_json::Value) -> Option<Self> {
        let usage = body.get("usage")?.as_object()?;
        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        Some(Self {
            prompt: field("prompt_tokens"),
            completion: field("completion_tokens"),
            total: field("total_tokens"),
        })
    }
}

/// Helper to generate unique IDs for correlating request lifecycle events
///
/// Format: `req_<ms-since-epoch>_<6 alphanumeric chars>`
pub fn generate_request_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let suffix: String = (0..6)
        .map(|_| CHARSET[fastrand::usize(..CHARSET.len())] as char)
        .collect();
    format!("req_{}_{}", Utc::now().timestamp_millis(), suffix)
}
