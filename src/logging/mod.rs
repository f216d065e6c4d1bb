// Logging module - tracing initialization for the gateway
//
// The gateway logs structured events to stderr so stdout stays free for
// shells and service wrappers. Filtering precedence: RUST_LOG env var >
// configured level > "info".

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber
///
/// `level` comes from the resolved config; axum and tower_http targets are
/// pinned to debug so proxy traces show up when the gateway level is raised.
pub fn init(level: &str) {
    let default_filter = format!("lmgate={level},tower_http=debug,axum=debug");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
