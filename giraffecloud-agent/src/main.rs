//! GiraffeCloud agent.
//!
//! Keeps a tunnel stream open to the edge and forwards relayed requests to
//! a local HTTP origin.

mod config;
mod state;
mod tunnel;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use config::{Config, ConfigFile};
use state::AgentState;

/// Default config file name.
const DEFAULT_CONFIG: &str = "giraffecloud.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    // Config file values become env-var defaults before clap parses, so the
    // precedence stays CLI > env > file.
    let config_path =
        std::env::var("GIRAFFE_AGENT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let path = std::path::Path::new(&config_path);
    if path.exists() {
        if let Ok(file_config) = ConfigFile::load(path) {
            file_config.inject_env();
        }
    }

    let config = Config::parse();
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server_url,
        origin = %config.origin_base(),
        "giraffecloud-agent starting"
    );

    let state = Arc::new(AgentState::new(config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tunnel::run(&state, shutdown_rx).await;
    info!("giraffecloud-agent stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
