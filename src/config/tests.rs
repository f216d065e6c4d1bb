//! Configuration tests
//!
//! The round-trip test keeps `to_toml` and `FileConfig` in sync: when you
//! add a config field, both must change or the template stops parsing.

use super::*;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Round-trip tests
// ─────────────────────────────────────────────────────────────────────────────

/// Verify that the generated template can be parsed back.
#[test]
fn default_config_round_trips_through_toml() {
    let config = Config::default();
    let toml_str = config.to_toml();

    let parsed: Result<FileConfig, _> = toml::from_str(&toml_str);
    assert!(
        parsed.is_ok(),
        "Default config should round-trip.\nTOML:\n{}\nError: {:?}",
        toml_str,
        parsed.err()
    );

    let file = parsed.unwrap();
    assert_eq!(file.backend_url.as_deref(), Some("http://127.0.0.1:1234"));
    assert_eq!(file.port, Some(8080));
    assert_eq!(file.allowlist, Some(vec!["*".to_string()]));
    assert_eq!(file.proxy_timeout_ms, Some(120_000));
    assert_eq!(file.proxy_stream_timeout_ms, Some(0));
}

#[test]
fn round_trip_preserves_non_default_values() {
    let config = Config {
        backend_url: "http://10.0.0.5:1234".into(),
        control_url: "ws://10.0.0.5:1234".into(),
        shared_secret: "s3cret".into(),
        allowlist: vec!["192.168.1.0/24".into(), "10.0.0.1".into()],
        require_auth_for_health: true,
        ..Config::default()
    };

    let file: FileConfig = toml::from_str(&config.to_toml()).unwrap();
    assert_eq!(file.api_key.as_deref(), Some("s3cret"));
    assert_eq!(file.require_auth_for_health, Some(true));
    assert_eq!(
        file.allowlist,
        Some(vec!["192.168.1.0/24".to_string(), "10.0.0.1".to_string()])
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Derivation helpers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn control_url_derives_by_scheme_swap() {
    assert_eq!(
        derive_control_url("http://127.0.0.1:1234"),
        "ws://127.0.0.1:1234"
    );
    assert_eq!(
        derive_control_url("https://backend.lan:443"),
        "wss://backend.lan:443"
    );
    // Bare host: assume plain ws
    assert_eq!(derive_control_url("backend.lan:1234"), "ws://backend.lan:1234");
}

#[test]
fn allowlist_parsing_trims_and_drops_empties() {
    assert_eq!(
        parse_allowlist("192.168.1.0/24, 10.0.0.1 ,,"),
        vec!["192.168.1.0/24".to_string(), "10.0.0.1".to_string()]
    );
    assert_eq!(parse_allowlist("*"), vec!["*".to_string()]);
    assert!(parse_allowlist("").is_empty());
}

#[test]
fn defaults_match_documented_values() {
    let config = Config::default();
    assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    assert!(config.shared_secret.is_empty());
    assert!(!config.require_auth_for_health);
    assert_eq!(config.proxy_timeout, Duration::from_millis(120_000));
    assert_eq!(config.proxy_stream_timeout, Duration::ZERO);
    assert!(!config.enable_log_monitoring);
    assert_eq!(config.log_level, "info");
}
