// Access filter - network allowlist and shared-secret gate
//
// Two independent checks run in fixed order on every request: the source
// address must clear the allowlist, then the X-API-Key header must match the
// shared secret. Either failure is terminal; nothing downstream runs.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use ipnet::IpNet;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::Config;

/// Immutable access policy resolved from config at startup
pub struct AccessFilter {
    allow_all: bool,
    addrs: Vec<IpAddr>,
    nets: Vec<IpNet>,
    /// Empty secret means auth is disabled
    secret: String,
    require_auth_for_health: bool,
}

impl AccessFilter {
    /// Parse the configured allowlist; invalid entries are startup errors
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut allow_all = false;
        let mut addrs = Vec::new();
        let mut nets = Vec::new();

        for entry in &config.allowlist {
            if entry == "*" {
                allow_all = true;
            } else if entry.contains('/') {
                let net: IpNet = entry
                    .parse()
                    .with_context(|| format!("Invalid CIDR in allowlist: {entry}"))?;
                nets.push(net);
            } else {
                let addr: IpAddr = entry
                    .parse()
                    .with_context(|| format!("Invalid IP in allowlist: {entry}"))?;
                addrs.push(canonical_ip(addr));
            }
        }

        Ok(Self {
            allow_all,
            addrs,
            nets,
            secret: config.shared_secret.clone(),
            require_auth_for_health: config.require_auth_for_health,
        })
    }

    /// Whether a source address clears the allowlist
    pub fn ip_allowed(&self, addr: IpAddr) -> bool {
        if self.allow_all {
            return true;
        }
        let addr = canonical_ip(addr);
        self.addrs.contains(&addr) || self.nets.iter().any(|net| net.contains(&addr))
    }

    /// Whether this path requires the shared secret
    pub fn needs_secret(&self, path: &str) -> bool {
        if self.secret.is_empty() {
            return false;
        }
        let is_health = path == "/health" || path == "/v1/health";
        !is_health || self.require_auth_for_health
    }

    /// Constant-time comparison of the presented key against the secret
    pub fn secret_matches(&self, presented: Option<&str>) -> bool {
        let Some(presented) = presented else {
            return false;
        };
        presented
            .as_bytes()
            .ct_eq(self.secret.as_bytes())
            .into()
    }
}

/// Strip the v4-mapped-v6 prefix so `::ffff:192.168.1.5` matches v4 entries
fn canonical_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// Short SHA-256 fingerprint for logging a presented key (never the key!)
fn fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Axum middleware applying both gates to every request
pub async fn access_middleware(
    State(filter): State<Arc<AccessFilter>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if !filter.ip_allowed(peer.ip()) {
        tracing::warn!(peer = %peer.ip(), "source address rejected by allowlist");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "Forbidden"})),
        )
            .into_response();
    }

    let path = req.uri().path();
    if filter.needs_secret(path) {
        let presented = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if !filter.secret_matches(presented) {
            match presented {
                Some(key) => tracing::warn!(
                    peer = %peer.ip(),
                    path,
                    key_fingerprint = %fingerprint(key),
                    "rejected request with wrong API key"
                ),
                None => tracing::warn!(
                    peer = %peer.ip(),
                    path,
                    "rejected request with missing API key"
                ),
            }
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Unauthorized"})),
            )
                .into_response();
        }
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with(allowlist: &[&str], secret: &str, auth_health: bool) -> AccessFilter {
        let config = Config {
            allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
            shared_secret: secret.to_string(),
            require_auth_for_health: auth_health,
            ..Config::default()
        };
        AccessFilter::from_config(&config).unwrap()
    }

    #[test]
    fn wildcard_accepts_any_source() {
        let filter = filter_with(&["*"], "", false);
        assert!(filter.ip_allowed("203.0.113.7".parse().unwrap()));
        assert!(filter.ip_allowed("::1".parse().unwrap()));
    }

    #[test]
    fn literal_ips_and_cidrs_both_match() {
        let filter = filter_with(&["10.0.0.1", "192.168.1.0/24"], "", false);
        assert!(filter.ip_allowed("10.0.0.1".parse().unwrap()));
        assert!(filter.ip_allowed("192.168.1.200".parse().unwrap()));
        assert!(!filter.ip_allowed("192.168.2.1".parse().unwrap()));
        assert!(!filter.ip_allowed("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn v4_mapped_v6_sources_match_v4_entries() {
        let filter = filter_with(&["192.168.1.0/24"], "", false);
        assert!(filter.ip_allowed("::ffff:192.168.1.5".parse().unwrap()));
        assert!(!filter.ip_allowed("::ffff:10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn invalid_allowlist_entries_fail_at_startup() {
        let config = Config {
            allowlist: vec!["not-an-ip".to_string()],
            ..Config::default()
        };
        assert!(AccessFilter::from_config(&config).is_err());
    }

    #[test]
    fn empty_secret_disables_the_key_check() {
        let filter = filter_with(&["*"], "", false);
        assert!(!filter.needs_secret("/v1/chat/completions"));
        assert!(!filter.needs_secret("/health"));
    }

    #[test]
    fn health_skips_auth_unless_configured() {
        let relaxed = filter_with(&["*"], "s3cret", false);
        assert!(!relaxed.needs_secret("/health"));
        assert!(!relaxed.needs_secret("/v1/health"));
        assert!(relaxed.needs_secret("/admin/models"));

        let strict = filter_with(&["*"], "s3cret", true);
        assert!(strict.needs_secret("/health"));
    }

    #[test]
    fn secret_comparison_requires_exact_match() {
        let filter = filter_with(&["*"], "s3cret", false);
        assert!(filter.secret_matches(Some("s3cret")));
        assert!(!filter.secret_matches(Some("s3cre")));
        assert!(!filter.secret_matches(Some("s3cret2")));
        assert!(!filter.secret_matches(None));
    }

    #[test]
    fn fingerprints_are_stable_short_hashes() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 16);
    }
}
