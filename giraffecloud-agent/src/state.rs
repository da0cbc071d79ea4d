//! Shared agent state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

pub struct AgentState {
    pub config: Arc<Config>,
    /// Client for origin requests (shared, pooled).
    pub client: reqwest::Client,
    /// Base URL of the local origin, e.g. `http://127.0.0.1:8000`.
    pub origin_base: String,
}

impl AgentState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .tcp_nodelay(config.tcp_nodelay)
            .build()?;
        let origin_base = config.origin_base();
        Ok(Self {
            config: Arc::new(config),
            client,
            origin_base,
        })
    }
}
