// Parser for backend log lines
//
// Lines look like `[2025-11-30 12:01:05][INFO] <message>`. Every well-formed
// line becomes a debug_log event; messages matching one of the known
// patterns additionally produce a typed telemetry event.

use std::collections::BTreeMap;

use regex::Regex;

use crate::events::GatewayEvent;

/// Sampling parameter keys the backend reports in `Sampling params:` lines
const SAMPLING_KEYS: &[&str] = &[
    "repeat_last_n",
    "repeat_penalty",
    "frequency_penalty",
    "presence_penalty",
    "dry_multiplier",
    "dry_base",
    "dry_allowed_length",
    "dry_penalty_last_n",
    "top_k",
    "top_p",
    "min_p",
    "xtc_probability",
    "xtc_threshold",
    "typical_p",
    "top_n_sigma",
    "temp",
    "mirostat",
    "mirostat_lr",
    "mirostat_ent",
];

/// A well-formed backend log line
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub raw: String,
}

/// Compiled extraction patterns
pub struct LineParser {
    line: Regex,
    key_value: Regex,
    progress: Regex,
    cache: Regex,
    generate: Regex,
    total_prompt: Regex,
    decode: Regex,
}

impl LineParser {
    pub fn new() -> Self {
        Self {
            line: Regex::new(
                r"^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\]\[(INFO|DEBUG|WARN|ERROR)\]\s?(.*)$",
            )
            .expect("line regex"),
            key_value: Regex::new(r"([a-z_]+)\s*=\s*(-?\d+(?:\.\d+)?)").expect("key_value regex"),
            progress: Regex::new(r"Prompt processing progress:\s*(\d+(?:\.\d+)?)%")
                .expect("progress regex"),
            cache: Regex::new(
                r"Cache reuse summary:\s*(\d+)/(\d+) of prompt \((\d+(?:\.\d+)?)%\),\s*(\d+) prefix,\s*(\d+) non-prefix",
            )
            .expect("cache regex"),
            generate: Regex::new(
                r"Generate:\s*n_ctx\s*=\s*(\d+),\s*n_batch\s*=\s*(\d+),\s*n_predict\s*=\s*(-?\d+),\s*n_keep\s*=\s*(\d+)",
            )
            .expect("generate regex"),
            total_prompt: Regex::new(r"Total prompt tokens:\s*(\d+)").expect("total_prompt regex"),
            decode: Regex::new(r"Prompt tokens to decode:\s*(\d+)").expect("decode regex"),
        }
    }

    /// Parse one raw line; malformed lines yield None and are ignored
    pub fn parse(&self, raw: &str) -> Option<ParsedLine> {
        let captures = self.line.captures(raw)?;
        Some(ParsedLine {
            timestamp: captures[1].to_string(),
            level: captures[2].to_string(),
            message: captures[3].to_string(),
            raw: raw.to_string(),
        })
    }

    /// Extract the typed telemetry event a message carries, if any
    pub fn extract(&self, message: &str) -> Option<GatewayEvent> {
        if message.contains("Running chat completion on conversation") {
            return Some(GatewayEvent::LmstudioChatStart {
                message: message.to_string(),
            });
        }

        if message.contains("Sampling params:") {
            let mut params = BTreeMap::new();
            for captures in self.key_value.captures_iter(message) {
                let key = &captures[1];
                if !SAMPLING_KEYS.contains(&key) {
                    continue;
                }
                if let Ok(value) = captures[2].parse::<f64>() {
                    params.insert(key.to_string(), value);
                }
            }
            if !params.is_empty() {
                return Some(GatewayEvent::LmstudioSamplingParams { params });
            }
            return None;
        }

        if let Some(captures) = self.progress.captures(message) {
            let progress: f64 = captures[1].parse().ok()?;
            return Some(GatewayEvent::LmstudioPromptProgress {
                progress,
                message: message.to_string(),
            });
        }

        if let Some(captures) = self.cache.captures(message) {
            return Some(GatewayEvent::LmstudioCacheStats {
                reused: captures[1].parse().ok()?,
                total: captures[2].parse().ok()?,
                percentage: captures[3].parse().ok()?,
                prefix: captures[4].parse().ok()?,
                non_prefix: captures[5].parse().ok()?,
                message: message.to_string(),
            });
        }

        if let Some(captures) = self.generate.captures(message) {
            return Some(GatewayEvent::LmstudioTokenInfo {
                n_ctx: captures[1].parse().ok(),
                n_batch: captures[2].parse().ok(),
                n_predict: captures[3].parse().ok(),
                n_keep: captures[4].parse().ok(),
                total_prompt_tokens: None,
                prompt_tokens_to_decode: None,
            });
        }

        if let Some(captures) = self.total_prompt.captures(message) {
            return Some(GatewayEvent::LmstudioTokenInfo {
                n_ctx: None,
                n_batch: None,
                n_predict: None,
                n_keep: None,
                total_prompt_tokens: captures[1].parse().ok(),
                prompt_tokens_to_decode: None,
            });
        }

        if let Some(captures) = self.decode.captures(message) {
            return Some(GatewayEvent::LmstudioTokenInfo {
                n_ctx: None,
                n_batch: None,
                n_predict: None,
                n_keep: None,
                total_prompt_tokens: None,
                prompt_tokens_to_decode: captures[1].parse().ok(),
            });
        }

        if message.contains("BeginProcessingPrompt") {
            return Some(GatewayEvent::LmstudioProcessingStart {
                message: "Begin processing prompt".to_string(),
            });
        }

        None
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}
