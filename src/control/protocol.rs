// Control channel wire protocol
//
// The backend's control channel speaks JSON frames over a WebSocket.
// Requests carry an integer id; replies echo it, so one session can
// multiplex calls from many gateway handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request frame
#[derive(Debug, Serialize)]
pub struct RequestFrame<'a> {
    pub id: u64,
    pub op: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Inbound reply frame
///
/// Long operations (load) may send interim frames carrying only `progress`
/// before the final frame; a frame is final once `ok` or `error` is set.
#[derive(Debug, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
}

impl ReplyFrame {
    /// Interim progress frames are not terminal
    pub fn is_progress(&self) -> bool {
        self.progress.is_some() && !self.ok && self.error.is_none()
    }
}

/// A model instance currently loaded in the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadedModel {
    pub path: String,
    pub identifier: String,
}

/// A model present on disk but not necessarily loaded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadedModel {
    pub path: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub model_type: String,
}

/// Sparse backend-side loading parameters
///
/// Unset fields are omitted from the wire frame so the backend applies its
/// own defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_threads: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rope_frequency_base: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rope_frequency_scale: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GpuConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layers: Option<u32>,
}

impl LoadConfig {
    /// Bounds checks; returns one message per violated field
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.context_length == Some(0) {
            errors.push("context_length must be positive".to_string());
        }
        if let Some(gpu) = &self.gpu {
            if let Some(ratio) = gpu.ratio {
                if !(0.0..=1.0).contains(&ratio) {
                    errors.push("gpu.ratio must be between 0 and 1".to_string());
                }
            }
        }
        if self.cpu_threads == Some(0) {
            errors.push("cpu_threads must be positive".to_string());
        }
        if let Some(base) = self.rope_frequency_base {
            if base <= 0.0 {
                errors.push("rope_frequency_base must be positive".to_string());
            }
        }
        if let Some(scale) = self.rope_frequency_scale {
            if scale <= 0.0 {
                errors.push("rope_frequency_scale must be positive".to_string());
            }
        }
        errors
    }
}

/// Find the loaded instance an unload request refers to
///
/// An explicit instance_id matches against identifiers; otherwise the model
/// key matches against paths.
pub fn resolve_unload<'a>(
    loaded: &'a [LoadedModel],
    model_key: &str,
    instance_id: Option<&str>,
) -> Option<&'a LoadedModel> {
    match instance_id {
        Some(id) => loaded.iter().find(|m| m.identifier == id),
        None => loaded.iter().find(|m| m.path == model_key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frames_omit_null_params() {
        let frame = RequestFrame {
            id: 7,
            op: "list_loaded",
            params: Value::Null,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": 7, "op": "list_loaded"})
        );
    }

    #[test]
    fn reply_frames_tolerate_missing_fields() {
        let reply: ReplyFrame = serde_json::from_str(r#"{"id": 3}"#).unwrap();
        assert_eq!(reply.id, 3);
        assert!(!reply.ok);
        assert!(reply.error.is_none());

        let reply: ReplyFrame =
            serde_json::from_str(r#"{"id": 4, "ok": false, "error": "no such model"}"#).unwrap();
        assert_eq!(reply.error.as_deref(), Some("no such model"));
    }

    #[test]
    fn progress_frames_are_interim_until_ok_or_error() {
        let interim: ReplyFrame =
            serde_json::from_str(r#"{"id": 5, "progress": 42.0}"#).unwrap();
        assert!(interim.is_progress());

        let done: ReplyFrame =
            serde_json::from_str(r#"{"id": 5, "ok": true, "progress": 100.0}"#).unwrap();
        assert!(!done.is_progress());

        let failed: ReplyFrame =
            serde_json::from_str(r#"{"id": 5, "error": "oom", "progress": 80.0}"#).unwrap();
        assert!(!failed.is_progress());
    }

    #[test]
    fn load_config_serializes_only_set_fields() {
        let config = LoadConfig {
            context_length: Some(4096),
            gpu: Some(GpuConfig {
                ratio: Some(0.5),
                layers: None,
            }),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({"context_length": 4096, "gpu": {"ratio": 0.5}})
        );
    }

    #[test]
    fn load_config_bounds_are_enforced() {
        let bad = LoadConfig {
            context_length: Some(0),
            gpu: Some(GpuConfig {
                ratio: Some(1.5),
                layers: Some(10),
            }),
            cpu_threads: Some(0),
            rope_frequency_base: Some(-1.0),
            rope_frequency_scale: Some(0.0),
        };
        let errors = bad.validation_errors();
        assert_eq!(errors.len(), 5);

        assert!(LoadConfig::default().validation_errors().is_empty());
    }

    #[test]
    fn unload_resolution_prefers_instance_id() {
        let loaded = vec![
            LoadedModel {
                path: "qwen2-1.5b".into(),
                identifier: "qwen2-1.5b:1".into(),
            },
            LoadedModel {
                path: "llama-3-8b".into(),
                identifier: "llama-3-8b:1".into(),
            },
        ];

        let by_id = resolve_unload(&loaded, "ignored", Some("llama-3-8b:1")).unwrap();
        assert_eq!(by_id.path, "llama-3-8b");

        let by_key = resolve_unload(&loaded, "qwen2-1.5b", None).unwrap();
        assert_eq!(by_key.identifier, "qwen2-1.5b:1");

        assert!(resolve_unload(&loaded, "missing", None).is_none());
        assert!(resolve_unload(&loaded, "qwen2-1.5b", Some("missing")).is_none());
    }
}
