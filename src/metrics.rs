// Derived metrics for /debug/metrics
//
// Nothing here is precomputed: every query walks the recent-request ring and
// aggregates on demand. Percentages and averages round to two decimals.

use serde::Serialize;

use crate::bus::EventBus;
use crate::state::{ActiveModel, AppState, RequestStatus};

/// JSON shape returned by `/debug/metrics`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub performance: Performance,
    /// Present only when at least one recent request carried token usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_stats: Option<TokenStats>,
    pub model: ActiveModel,
    pub events: EventStats,
    pub system: SystemInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct Performance {
    pub total_requests: u64,
    pub total_errors: u64,
    /// Errors as a percentage of terminal outcomes (completions + failures)
    pub error_rate: f64,
    pub completed_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median_response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_response_time_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStats {
    pub requests_with_usage: usize,
    pub avg_tokens_per_second: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub avg_prompt_tokens: f64,
    pub avg_completion_tokens: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub subscribers: usize,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub uptime_seconds: i64,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss_bytes: Option<u64>,
}

/// Round to two decimal places for JSON output
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Aggregate the current state into a metrics response
pub fn compute(state: &AppState, bus: &EventBus) -> MetricsResponse {
    let completed: Vec<_> = state
        .recent_requests
        .iter()
        .filter(|r| r.status == RequestStatus::Completed)
        .collect();

    let mut times: Vec<u64> = completed.iter().filter_map(|r| r.time_ms).collect();
    times.sort_unstable();

    let (min, max) = (times.first().copied(), times.last().copied());
    let avg = if times.is_empty() {
        None
    } else {
        Some(round2(
            times.iter().sum::<u64>() as f64 / times.len() as f64,
        ))
    };
    let median = match times.len() {
        0 => None,
        n if n % 2 == 1 => Some(times[n / 2] as f64),
        n => Some(round2((times[n / 2 - 1] + times[n / 2]) as f64 / 2.0)),
    };

    let terminal = state.total_requests + state.total_errors;
    let error_rate = if terminal == 0 {
        0.0
    } else {
        round2(state.total_errors as f64 / terminal as f64 * 100.0)
    };

    MetricsResponse {
        performance: Performance {
            total_requests: state.total_requests,
            total_errors: state.total_errors,
            error_rate,
            completed_count: completed.len(),
            min_response_time_ms: min,
            median_response_time_ms: median,
            max_response_time_ms: max,
            avg_response_time_ms: avg,
        },
        token_stats: token_stats(&completed),
        model: state.active_model.clone(),
        events: EventStats {
            subscribers: bus.subscriber_count(),
            dropped: bus.dropped_events(),
        },
        system: SystemInfo {
            uptime_seconds: state.uptime_seconds(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            memory_rss_bytes: resident_memory_bytes(),
        },
    }
}

/// Token aggregates over recent requests that reported usage
fn token_stats(completed: &[&crate::state::RequestRecord]) -> Option<TokenStats> {
    let with_usage: Vec<_> = completed
        .iter()
        .filter_map(|r| r.token_usage.map(|u| (u, r.time_ms)))
        .collect();
    if with_usage.is_empty() {
        return None;
    }

    let total_prompt: u64 = with_usage.iter().map(|(u, _)| u.prompt).sum();
    let total_completion: u64 = with_usage.iter().map(|(u, _)| u.completion).sum();
    let count = with_usage.len() as f64;

    // Throughput only over requests with a positive elapsed time
    let rates: Vec<f64> = with_usage
        .iter()
        .filter_map(|(u, time_ms)| {
            let ms = (*time_ms)?;
            (ms > 0).then(|| u.total as f64 / (ms as f64 / 1000.0))
        })
        .collect();
    let avg_rate = if rates.is_empty() {
        0.0
    } else {
        rates.iter().sum::<f64>() / rates.len() as f64
    };

    Some(TokenStats {
        requests_with_usage: with_usage.len(),
        avg_tokens_per_second: round2(avg_rate),
        total_prompt_tokens: total_prompt,
        total_completion_tokens: total_completion,
        avg_prompt_tokens: round2(total_prompt as f64 / count),
        avg_completion_tokens: round2(total_completion as f64 / count),
    })
}

/// Resident set size of this process, when the platform exposes it cheaply
fn resident_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
