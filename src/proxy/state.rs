//! Proxy state types shared across gateway handlers

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::bus::EventBus;
use crate::config::Config;
use crate::control::ControlClient;
use crate::state::SharedAppState;

/// Shared state for the gateway server
#[derive(Clone)]
pub struct GatewayState {
    /// HTTP client for forwarding requests
    pub client: reqwest::Client,
    /// Backend OpenAI-compatible base URL
    pub backend_url: String,
    /// Timeout for non-streaming proxied requests
    pub proxy_timeout: Duration,
    /// Timeout for streaming proxied requests; zero means unbounded
    pub stream_timeout: Duration,
    /// Event bus feeding /debug/stream subscribers
    pub bus: EventBus,
    /// In-memory gateway state (active model, recent requests, counters)
    pub app: SharedAppState,
    /// Control channel client for model lifecycle operations
    pub control: Arc<ControlClient>,
}

impl GatewayState {
    pub fn new(
        config: &Config,
        bus: EventBus,
        app: SharedAppState,
        control: Arc<ControlClient>,
    ) -> Result<Self> {
        // No global client timeout: per-request timeouts differ between the
        // buffered and streaming paths.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            // Force HTTP/1.1 to avoid HTTP/2 connection reset issues with some backends
            .http1_only()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            backend_url: config.backend_url.clone(),
            proxy_timeout: config.proxy_timeout,
            stream_timeout: config.proxy_stream_timeout,
            bus,
            app,
            control,
        })
    }
}
