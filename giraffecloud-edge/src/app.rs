//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::api;
use crate::api::auth::StaticTokenAuthorizer;
use crate::audit::LogAuditSink;
use crate::config::Config;
use crate::dispatch;
use crate::dispatch::classify::Classifier;
use crate::quota::QuotaService;
use crate::registry::TunnelRegistry;
use crate::state::AppState;
use crate::store::{MemoryStore, SqliteStore, Store};
use crate::usage::UsageTracker;

pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        public_addr = %config.public_addr,
        api_addr = %config.api_addr,
        "giraffecloud-edge starting"
    );

    let config = Arc::new(config);
    let store: Arc<dyn Store> = match &config.database {
        Some(path) => {
            info!(path = %path, "opening sqlite store");
            Arc::new(SqliteStore::open(path).map_err(|e| anyhow::anyhow!(e))?)
        }
        None => {
            warn!("no database configured, using a volatile in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let usage = Arc::new(UsageTracker::new(
        Arc::clone(&store),
        config.usage_flush_watermark,
    ));
    let quota = Arc::new(QuotaService::new(Arc::clone(&store), &config));
    let registry = Arc::new(TunnelRegistry::new());
    let authorizer =
        Arc::new(StaticTokenAuthorizer::from_config(&config).map_err(|e| anyhow::anyhow!(e))?);
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        registry: Arc::clone(&registry),
        usage: Arc::clone(&usage),
        quota,
        authorizer,
        audit: Arc::new(LogAuditSink),
        classifier: Classifier::from_config(&config),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = usage.spawn_flusher(
        Duration::from_secs(config.usage_flush_interval_secs),
        shutdown_rx.clone(),
    );

    let public_listener = TcpListener::bind(&config.public_addr).await?;
    let api_listener = TcpListener::bind(&config.api_addr).await?;

    let public_task = tokio::spawn(serve(
        public_listener,
        dispatch::ingress_router(Arc::clone(&state)),
        shutdown_rx.clone(),
    ));
    let api_task = tokio::spawn(serve(
        api_listener,
        api::control_router(Arc::clone(&state)),
        shutdown_rx.clone(),
    ));

    wait_for_shutdown().await;
    info!(
        active_sessions = registry.len(),
        "shutdown signal received, draining sessions"
    );
    drain_sessions(&registry, Duration::from_secs(config.drain_window_secs)).await;

    let _ = shutdown_tx.send(true);
    let _ = public_task.await;
    let _ = api_task.await;
    // The flusher performs its mandatory final flush before exiting.
    let _ = flusher.await;
    info!("giraffecloud-edge stopped");
    Ok(())
}

async fn serve(listener: TcpListener, router: axum::Router, mut shutdown: watch::Receiver<bool>) {
    let service = router.into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, service)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        warn!(error = %e, "server exited with error");
    }
}

/// Put every session into `Draining`, give in-flight requests up to the
/// drain window to finish, then force-close whatever is left.
async fn drain_sessions(registry: &Arc<TunnelRegistry>, window: Duration) {
    let sessions = registry.snapshot();
    if sessions.is_empty() {
        return;
    }
    info!(sessions = sessions.len(), "draining live sessions");
    for session in &sessions {
        session.begin_drain();
    }

    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if registry.snapshot().iter().all(|s| s.pending_len() == 0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    for session in registry.snapshot() {
        session.trigger_close();
    }
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
