// Gateway state - the single in-memory record of what the gateway is doing
//
// One mutex guards everything: the active model, the current long-running
// operation, and the ring of recent request outcomes. Critical sections are
// short field reads/writes; no I/O ever happens under the lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::TokenUsage;

/// Ring buffer capacity for recent request records
pub const RECENT_REQUESTS_CAP: usize = 100;

/// How many recent requests `/debug/status` reports
const STATUS_RECENT_LIMIT: usize = 10;

/// Shared handle to the gateway state
pub type SharedAppState = Arc<Mutex<AppState>>;

/// Sparse sampling defaults attached to the active model
///
/// Unset fields are left to the backend; set fields are copied into proxied
/// request bodies when the client did not provide them itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_strings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl InferenceDefaults {
    /// Copy set defaults into a request body, never overwriting client fields
    ///
    /// Field mapping follows the OpenAI request schema; `stop_strings` maps
    /// to the `stop` list.
    pub fn apply_to(&self, body: &mut serde_json::Map<String, serde_json::Value>) {
        use serde_json::json;

        let mut set_if_absent = |key: &str, value: serde_json::Value| {
            if !body.contains_key(key) {
                body.insert(key.to_string(), value);
            }
        };

        if let Some(v) = self.temperature {
            set_if_absent("temperature", json!(v));
        }
        if let Some(v) = self.max_tokens {
            set_if_absent("max_tokens", json!(v));
        }
        if let Some(v) = self.top_p {
            set_if_absent("top_p", json!(v));
        }
        if let Some(v) = self.top_k {
            set_if_absent("top_k", json!(v));
        }
        if let Some(v) = self.repeat_penalty {
            set_if_absent("repeat_penalty", json!(v));
        }
        if let Some(v) = &self.stop_strings {
            set_if_absent("stop", json!(v));
        }
        if let Some(v) = self.stream {
            set_if_absent("stream", json!(v));
        }
    }

    /// Bounds checks for admin payloads; one message per violated field
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(t) = self.temperature {
            if t < 0.0 {
                errors.push("temperature must be >= 0".to_string());
            }
        }
        if self.max_tokens == Some(0) {
            errors.push("max_tokens must be positive".to_string());
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                errors.push("top_p must be between 0 and 1".to_string());
            }
        }
        if let Some(r) = self.repeat_penalty {
            if r <= 0.0 {
                errors.push("repeat_penalty must be positive".to_string());
            }
        }
        errors
    }
}

/// The model the proxy augments requests with
///
/// A `None` model_key means no model is active and requests pass through
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveModel {
    pub model_key: Option<String>,
    pub instance_id: Option<String>,
    #[serde(default)]
    pub default_inference: InferenceDefaults,
}

impl ActiveModel {
    /// The identifier to inject as the request `model` field
    ///
    /// Prefers the backend instance id over the model key.
    pub fn injection_id(&self) -> Option<&str> {
        self.instance_id.as_deref().or(self.model_key.as_deref())
    }

    /// Whether an unload of the given target should clear this record
    pub fn matches(&self, model_key: &str, instance_id: Option<&str>) -> bool {
        if let (Some(active), Some(target)) = (self.instance_id.as_deref(), instance_id) {
            if active == target {
                return true;
            }
        }
        self.model_key.as_deref() == Some(model_key)
    }
}

/// Coarse gateway status surfaced by `/debug/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Idle,
    LoadingModel,
    ProcessingInference,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Load,
    Unload,
    Inference,
}

/// The long-running operation currently in flight, if any
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    pub kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
}

/// Outcome of one proxied request, kept in the recent-requests ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the gateway tracks in memory
#[derive(Debug)]
pub struct AppState {
    pub active_model: ActiveModel,
    pub status: GatewayStatus,
    pub current_operation: Option<OperationInfo>,
    pub recent_requests: VecDeque<RequestRecord>,
    pub total_requests: u64,
    pub total_errors: u64,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            active_model: ActiveModel::default(),
            status: GatewayStatus::Idle,
            current_operation: None,
            recent_requests: VecDeque::with_capacity(RECENT_REQUESTS_CAP),
            total_requests: 0,
            total_errors: 0,
            started_at: Utc::now(),
        }
    }

    pub fn shared() -> SharedAppState {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Start a new long-running operation
    ///
    /// Any previous operation is cleared first; at most one is live.
    pub fn begin_operation(
        &mut self,
        kind: OperationKind,
        model_key: Option<String>,
        progress: Option<f64>,
    ) {
        self.current_operation = None;
        self.current_operation = Some(OperationInfo {
            kind,
            model_key,
            progress,
            started_at: Utc::now(),
        });
    }

    pub fn clear_operation(&mut self) {
        self.current_operation = None;
    }

    /// Mark the gateway busy with a proxied inference
    ///
    /// A live admin operation wins: the gauge is left untouched so load
    /// progress stays visible while requests flow.
    pub fn begin_inference(&mut self) {
        if self.current_operation.is_none() {
            self.begin_operation(OperationKind::Inference, None, None);
            self.status = GatewayStatus::ProcessingInference;
        }
    }

    /// Clear the inference gauge if this request set it
    pub fn end_inference(&mut self) {
        let inference_live = matches!(
            self.current_operation.as_ref().map(|op| op.kind),
            Some(OperationKind::Inference)
        );
        if inference_live {
            self.clear_operation();
            if self.status == GatewayStatus::ProcessingInference {
                self.status = GatewayStatus::Idle;
            }
        }
    }

    /// Record a request that delivered a response
    pub fn record_completion(
        &mut self,
        request_id: String,
        time_ms: u64,
        token_usage: Option<TokenUsage>,
    ) {
        self.push_record(RequestRecord {
            request_id,
            status: RequestStatus::Completed,
            time_ms: Some(time_ms),
            token_usage,
            timestamp: Utc::now(),
        });
        self.total_requests += 1;
    }

    /// Record a request that failed before a response was delivered
    pub fn record_failure(&mut self, request_id: String, time_ms: u64) {
        self.push_record(RequestRecord {
            request_id,
            status: RequestStatus::Failed,
            time_ms: Some(time_ms),
            token_usage: None,
            timestamp: Utc::now(),
        });
        self.total_errors += 1;
    }

    fn push_record(&mut self, record: RequestRecord) {
        if self.recent_requests.len() >= RECENT_REQUESTS_CAP {
            self.recent_requests.pop_front();
        }
        self.recent_requests.push_back(record);
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    /// Snapshot for `/debug/status`, recent requests truncated to the last 10
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let skip = self.recent_requests.len().saturating_sub(STATUS_RECENT_LIMIT);
        StatusSnapshot {
            status: self.status,
            active_model: self.active_model.clone(),
            current_operation: self.current_operation.clone(),
            recent_requests: self.recent_requests.iter().skip(skip).cloned().collect(),
            total_requests: self.total_requests,
            total_errors: self.total_errors,
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON shape returned by `/debug/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: GatewayStatus,
    pub active_model: ActiveModel,
    pub current_operation: Option<OperationInfo>,
    pub recent_requests: Vec<RequestRecord>,
    pub total_requests: u64,
    pub total_errors: u64,
    pub uptime_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_holds_exactly_one_hundred_and_evicts_oldest() {
        let mut state = AppState::new();
        for n in 0..(RECENT_REQUESTS_CAP + 1) {
            state.record_completion(format!("req_{n}"), 10, None);
        }
        assert_eq!(state.recent_requests.len(), RECENT_REQUESTS_CAP);
        assert_eq!(state.recent_requests.front().unwrap().request_id, "req_1");
        assert_eq!(
            state.recent_requests.back().unwrap().request_id,
            format!("req_{RECENT_REQUESTS_CAP}")
        );
        assert_eq!(state.total_requests, (RECENT_REQUESTS_CAP + 1) as u64);
    }

    #[test]
    fn failures_count_errors_not_requests() {
        let mut state = AppState::new();
        state.record_completion("req_a".into(), 20, None);
        state.record_failure("req_b".into(), 5);
        assert_eq!(state.total_requests, 1);
        assert_eq!(state.total_errors, 1);
        assert_eq!(
            state.recent_requests.back().unwrap().status,
            RequestStatus::Failed
        );
    }

    #[test]
    fn completed_records_always_carry_time_ms() {
        let mut state = AppState::new();
        state.record_completion("req_a".into(), 42, None);
        let record = state.recent_requests.back().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.time_ms, Some(42));
    }

    #[test]
    fn status_snapshot_truncates_to_last_ten() {
        let mut state = AppState::new();
        for n in 0..25 {
            state.record_completion(format!("req_{n}"), 10, None);
        }
        let snapshot = state.status_snapshot();
        assert_eq!(snapshot.recent_requests.len(), 10);
        assert_eq!(snapshot.recent_requests[0].request_id, "req_15");
        assert_eq!(snapshot.recent_requests[9].request_id, "req_24");
        assert_eq!(snapshot.total_requests, 25);
    }

    #[test]
    fn begin_operation_replaces_any_previous_operation() {
        let mut state = AppState::new();
        state.begin_operation(OperationKind::Load, Some("m1".into()), Some(0.0));
        state.begin_operation(OperationKind::Unload, Some("m2".into()), None);
        let op = state.current_operation.as_ref().unwrap();
        assert_eq!(op.kind, OperationKind::Unload);
        assert_eq!(op.model_key.as_deref(), Some("m2"));
        state.clear_operation();
        assert!(state.current_operation.is_none());
    }

    #[test]
    fn defaults_apply_without_overwriting_client_fields() {
        let defaults = InferenceDefaults {
            temperature: Some(0.2),
            max_tokens: Some(256),
            stop_strings: Some(vec!["<end>".into()]),
            ..Default::default()
        };
        let mut body = serde_json::json!({"temperature": 0.9})
            .as_object()
            .unwrap()
            .clone();
        defaults.apply_to(&mut body);
        assert_eq!(body["temperature"], 0.9);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stop"], serde_json::json!(["<end>"]));
    }

    #[test]
    fn injection_id_prefers_instance_id() {
        let model = ActiveModel {
            model_key: Some("qwen2-1.5b".into()),
            instance_id: Some("qwen2-1.5b:2".into()),
            default_inference: InferenceDefaults::default(),
        };
        assert_eq!(model.injection_id(), Some("qwen2-1.5b:2"));

        let bare = ActiveModel {
            model_key: Some("qwen2-1.5b".into()),
            instance_id: None,
            default_inference: InferenceDefaults::default(),
        };
        assert_eq!(bare.injection_id(), Some("qwen2-1.5b"));
        assert_eq!(ActiveModel::default().injection_id(), None);
    }

    #[test]
    fn unload_matching_checks_instance_then_key() {
        let model = ActiveModel {
            model_key: Some("m".into()),
            instance_id: Some("m:1".into()),
            default_inference: InferenceDefaults::default(),
        };
        assert!(model.matches("m", None));
        assert!(model.matches("other", Some("m:1")));
        assert!(!model.matches("other", Some("m:2")));
    }
}
