//! Tunnel client: connect to the edge, authenticate, and run the session.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::state::AgentState;

use super::{dispatcher, heartbeat, writer};

/// Outcome of one tunnel session.
pub enum TunnelOutcome {
    /// Graceful shutdown requested by the local process.
    Shutdown,
    /// Remote side disconnected or connection lost; the caller reconnects.
    Disconnected,
}

/// Connect to the edge's tunnel endpoint and run until disconnected.
pub async fn connect_and_run(
    state: &Arc<AgentState>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<TunnelOutcome, anyhow::Error> {
    let ws_url = build_stream_url(&state.config.server_url);
    info!(url = %ws_url, "connecting tunnel");

    // The tunnel token rides in the upgrade request's credentials.
    let mut request = ws_url.clone().into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        http::HeaderValue::from_str(&format!("Bearer {}", state.config.token))?,
    );

    let uri: http::Uri = ws_url.parse()?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("missing host in tunnel URL"))?;
    let is_tls = uri.scheme_str() == Some("wss");
    let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

    let connect_timeout = Duration::from_secs(state.config.connect_timeout_secs);
    let tcp_stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            anyhow::anyhow!("tunnel TCP connect timeout ({}s)", connect_timeout.as_secs())
        })??;

    configure_tcp_socket(&tcp_stream, state);

    let connector = if is_tls {
        Some(tokio_tungstenite::Connector::Rustls(Arc::new(
            build_tls_config(),
        )))
    } else {
        None
    };
    // Room for one full body chunk plus the metadata block.
    let ws_config = WebSocketConfig {
        max_frame_size: Some(8 << 20),
        max_message_size: Some(8 << 20),
        ..Default::default()
    };
    let (ws_stream, _response) = tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::client_async_tls_with_config(
            request,
            tcp_stream,
            Some(ws_config),
            connector,
        ),
    )
    .await
    .map_err(|_| {
        anyhow::anyhow!(
            "tunnel handshake timeout ({}s)",
            connect_timeout.as_secs()
        )
    })??;
    info!(
        tcp_keepalive_secs = state.config.tcp_keepalive_secs,
        tcp_nodelay = state.config.tcp_nodelay,
        "tunnel connected"
    );

    let (ws_sink, ws_read) = futures_util::StreamExt::split(ws_stream);

    let (frame_tx, mut writer_handle) = writer::spawn_writer(ws_sink);

    let hb_interval: heartbeat::IntervalHandle =
        Arc::new(AtomicU64::new(state.config.heartbeat_interval_secs));
    let hb_task = heartbeat::spawn(frame_tx.clone(), Arc::clone(&hb_interval), shutdown.clone());

    // Run the dispatcher, and watch the writer: if the write half dies while
    // the read half stays open, the dispatcher would block forever on the
    // stream, so a writer exit also triggers a reconnect.
    let state_clone = Arc::clone(state);
    let outcome = tokio::select! {
        result = dispatcher::run(state_clone, ws_read, frame_tx.clone(), hb_interval) => {
            match result {
                Ok(()) => TunnelOutcome::Disconnected,
                Err(e) => {
                    hb_task.abort();
                    return Err(e);
                }
            }
        }
        writer_result = &mut writer_handle => {
            match writer_result {
                Ok(()) => warn!("writer task exited, triggering reconnect"),
                Err(e) => warn!(error = %e, "writer task failed, triggering reconnect"),
            }
            TunnelOutcome::Disconnected
        }
        _ = shutdown.changed() => {
            debug!("shutdown during tunnel dispatch");
            TunnelOutcome::Shutdown
        }
    };

    hb_task.abort();

    // Drop our sender; the writer exits once the handler clones drop too.
    drop(frame_tx);
    if !writer_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(35), writer_handle).await;
    }

    info!("tunnel disconnected");
    Ok(outcome)
}

/// Configure TCP keepalive and NODELAY on the established socket.
fn configure_tcp_socket(stream: &TcpStream, state: &Arc<AgentState>) {
    let sock_ref = socket2::SockRef::from(stream);

    if state.config.tcp_keepalive_secs > 0 {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(state.config.tcp_keepalive_secs))
            .with_interval(Duration::from_secs(5));
        #[cfg(not(target_os = "windows"))]
        let keepalive = keepalive.with_retries(3);
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            warn!(error = %e, "failed to set TCP keepalive on tunnel socket");
        }
    }

    if state.config.tcp_nodelay {
        if let Err(e) = sock_ref.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on tunnel socket");
        }
    }
}

/// rustls client config with the webpki root set.
pub fn build_tls_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn build_stream_url(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{base}")
    };
    format!("{ws_base}/tunnel/stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_schemes() {
        assert_eq!(
            build_stream_url("https://edge.example"),
            "wss://edge.example/tunnel/stream"
        );
        assert_eq!(
            build_stream_url("http://localhost:8081/"),
            "ws://localhost:8081/tunnel/stream"
        );
        assert_eq!(
            build_stream_url("edge.example"),
            "wss://edge.example/tunnel/stream"
        );
    }
}
