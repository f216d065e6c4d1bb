//! Configuration for the gateway
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/lmgate/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(test)]
mod tests;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration, frozen at startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend OpenAI-compatible HTTP base URL
    pub backend_url: String,

    /// Backend control channel URL (derived from backend_url when not set)
    pub control_url: String,

    /// Host to bind the gateway to
    pub bind_host: String,

    /// Port to bind the gateway to
    pub bind_port: u16,

    /// Shared secret for the X-API-Key header; empty disables auth
    pub shared_secret: String,

    /// Source allowlist: IPs, CIDRs, or the wildcard "*"
    pub allowlist: Vec<String>,

    /// Whether /health also requires the shared secret
    pub require_auth_for_health: bool,

    /// Timeout for non-streaming proxied requests
    pub proxy_timeout: Duration,

    /// Timeout for streaming proxied requests; zero means unbounded
    pub proxy_stream_timeout: Duration,

    /// Root of the backend's rolling log directory
    pub log_dir: PathBuf,

    /// Whether to tail the backend's log files
    pub enable_log_monitoring: bool,

    /// Gateway log level: error, warn, info, debug
    pub log_level: String,
}

impl Config {
    /// "host:port" string for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        let backend_url = "http://127.0.0.1:1234".to_string();
        Self {
            control_url: derive_control_url(&backend_url),
            backend_url,
            bind_host: "0.0.0.0".to_string(),
            bind_port: 8080,
            shared_secret: String::new(),
            allowlist: vec!["*".to_string()],
            require_auth_for_health: false,
            proxy_timeout: Duration::from_millis(120_000),
            proxy_stream_timeout: Duration::ZERO,
            log_dir: PathBuf::from("./logs"),
            enable_log_monitoring: false,
            log_level: "info".to_string(),
        }
    }
}

/// Derive the control channel URL by swapping the HTTP scheme for WS
pub fn derive_control_url(backend_url: &str) -> String {
    if let Some(rest) = backend_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = backend_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{backend_url}")
    }
}

/// Parse a comma-separated allowlist into entries, dropping empties
pub fn parse_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse boolean env values: "1"/"true" (any case) are true
fn parse_bool(raw: &str) -> bool {
    raw == "1" || raw.eq_ignore_ascii_case("true")
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub backend_url: Option<String>,
    pub control_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub allowlist: Option<Vec<String>>,
    pub require_auth_for_health: Option<bool>,
    pub proxy_timeout_ms: Option<u64>,
    pub proxy_stream_timeout_ms: Option<u64>,
    pub log_dir: Option<String>,
    pub enable_log_monitoring: Option<bool>,
    pub log_level: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/lmgate/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("lmgate").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        // Don't overwrite existing config
        if path.exists() {
            return;
        }

        // Create parent directory
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }

        // Write config (ignore errors - config is optional)
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Load file config if it exists
    ///
    /// A broken config fails fast with a clear error instead of silently
    /// falling back to defaults while the user debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("\nCONFIG ERROR - Failed to parse configuration file\n");
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  To reset, delete the file and restart lmgate.\n");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\nCONFIG ERROR - Cannot read configuration file\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let defaults = Self::default();

        // Backend HTTP base URL: env > file > default
        let backend_url = std::env::var("LMGATE_BACKEND_URL")
            .ok()
            .or(file.backend_url)
            .unwrap_or(defaults.backend_url);

        // Control channel URL: env > file > derived from the HTTP base
        let control_url = std::env::var("LMGATE_CONTROL_URL")
            .ok()
            .or(file.control_url)
            .unwrap_or_else(|| derive_control_url(&backend_url));

        let bind_host = std::env::var("LMGATE_HOST")
            .ok()
            .or(file.host)
            .unwrap_or(defaults.bind_host);

        let bind_port = match std::env::var("LMGATE_PORT") {
            Ok(raw) => match raw.parse() {
                Ok(port) => port,
                Err(_) => {
                    eprintln!("CONFIG ERROR - Invalid LMGATE_PORT value: {raw}");
                    std::process::exit(1);
                }
            },
            Err(_) => file.port.unwrap_or(defaults.bind_port),
        };

        let shared_secret = std::env::var("LMGATE_API_KEY")
            .ok()
            .or(file.api_key)
            .unwrap_or_default();

        let allowlist = std::env::var("LMGATE_ALLOWLIST")
            .ok()
            .map(|raw| parse_allowlist(&raw))
            .or(file.allowlist)
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.allowlist);

        let require_auth_for_health = std::env::var("LMGATE_AUTH_HEALTH")
            .map(|v| parse_bool(&v))
            .unwrap_or_else(|_| file.require_auth_for_health.unwrap_or(false));

        let proxy_timeout_ms = std::env::var("LMGATE_PROXY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.proxy_timeout_ms)
            .unwrap_or(120_000);

        let proxy_stream_timeout_ms = std::env::var("LMGATE_STREAM_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.proxy_stream_timeout_ms)
            .unwrap_or(0);

        let log_dir = std::env::var("LMGATE_LOG_DIR")
            .ok()
            .or(file.log_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir);

        let enable_log_monitoring = std::env::var("LMGATE_LOG_MONITOR")
            .map(|v| parse_bool(&v))
            .unwrap_or_else(|_| file.enable_log_monitoring.unwrap_or(false));

        let log_level = std::env::var("LMGATE_LOG_LEVEL")
            .ok()
            .or(file.log_level)
            .unwrap_or(defaults.log_level);

        Self {
            backend_url,
            control_url,
            bind_host,
            bind_port,
            shared_secret,
            allowlist,
            require_auth_for_health,
            proxy_timeout: Duration::from_millis(proxy_timeout_ms),
            proxy_stream_timeout: Duration::from_millis(proxy_stream_timeout_ms),
            log_dir,
            enable_log_monitoring,
            log_level,
        }
    }

    /// Render this config as a commented TOML template
    ///
    /// Single source of truth for the generated config file; the round-trip
    /// test in `tests.rs` keeps it parseable.
    pub fn to_toml(&self) -> String {
        let allowlist = self
            .allowlist
            .iter()
            .map(|e| format!("{:?}", e))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"# lmgate configuration
# Values here are overridden by LMGATE_* environment variables.

# Backend OpenAI-compatible HTTP base URL
backend_url = {backend:?}

# Control channel URL; omit to derive from backend_url (http -> ws)
control_url = {control:?}

# Bind address for the gateway
host = {host:?}
port = {port}

# Shared secret for the X-API-Key header; empty disables auth
api_key = {api_key:?}

# Source allowlist: IPs, CIDRs, or "*" to accept everything
allowlist = [{allowlist}]

# Require the shared secret for /health too
require_auth_for_health = {auth_health}

# Timeouts in milliseconds; stream timeout 0 means unbounded
proxy_timeout_ms = {proxy_timeout}
proxy_stream_timeout_ms = {stream_timeout}

# Backend rolling log directory and whether to tail it
log_dir = {log_dir:?}
enable_log_monitoring = {log_monitor}

# Gateway log level: error, warn, info, debug
log_level = {log_level:?}
"#,
            backend = self.backend_url,
            control = self.control_url,
            host = self.bind_host,
            port = self.bind_port,
            api_key = self.shared_secret,
            allowlist = allowlist,
            auth_health = self.require_auth_for_health,
            proxy_timeout = self.proxy_timeout.as_millis(),
            stream_timeout = self.proxy_stream_timeout.as_millis(),
            log_dir = self.log_dir.display().to_string(),
            log_monitor = self.enable_log_monitoring,
            log_level = self.log_level,
        )
    }
}
