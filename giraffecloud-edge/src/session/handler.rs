//! Agent endpoint: WebSocket handshake, receive loop, and watchdog.
//!
//! The agent opens a bidirectional stream carrying its tunnel token. After
//! authentication the session is registered under the tunnel's domain
//! (evicting any prior session), a hello with negotiated parameters goes
//! out, and the receive loop demultiplexes inbound envelopes until
//! disconnect or idle timeout.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use giraffecloud_proto::{Frame, HelloMeta, MsgType, ProtocolError, META_HEADROOM};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::auth::bearer_token;
use crate::audit::AuditEvent;
use crate::error::Error;
use crate::session::pending::Deliver;
use crate::session::{SessionState, TunnelSession};
use crate::state::AppState;
use crate::store::TunnelRecord;

/// `GET /tunnel/stream` — agent handshake and upgrade.
pub async fn agent_stream_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return Error::Unauthenticated("missing tunnel token".into()).into_response();
    };
    let tunnel = match state.store.tunnel_by_token(token).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            return Error::Unauthenticated("unknown or revoked tunnel token".into()).into_response()
        }
        Err(e) => return Error::from(e).into_response(),
    };
    if !tunnel.is_enabled {
        return Error::Unauthenticated(format!("tunnel {} is disabled", tunnel.domain))
            .into_response();
    }
    ws.on_upgrade(move |socket| run_session(state, tunnel, addr.ip().to_string(), socket))
}

fn heartbeat_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 3).max(Duration::from_secs(1))
}

async fn run_session(
    state: Arc<AppState>,
    tunnel: TunnelRecord,
    client_ip: String,
    socket: WebSocket,
) {
    let config = Arc::clone(&state.config);
    let (sink, mut stream) = socket.split();
    let (session, mut close_rx) = TunnelSession::new(
        tunnel.id,
        tunnel.user_id,
        tunnel.domain.clone(),
        client_ip.clone(),
        Some(sink),
        Duration::from_secs(config.write_deadline_secs),
    );

    if let Some(evicted) = state.registry.register(Arc::clone(&session)) {
        warn!(domain = %session.domain, "new agent connection evicts prior session");
        state.audit.record(
            AuditEvent::new("session.evicted", evicted.user_id, evicted.tunnel_id, &evicted.domain)
                .with_detail("replaced by a newer agent connection"),
        );
        evicted.trigger_close();
    }

    if let Err(e) = state
        .store
        .set_client_ip(tunnel.id, Some(&client_ip))
        .await
    {
        warn!(domain = %session.domain, error = %e, "failed to record agent ip");
    }

    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    let hb_interval = heartbeat_interval(idle_timeout);
    let hello = HelloMeta {
        chunk_size: config.chunk_size_bytes as u64,
        large_file_threshold: config.large_file_threshold_bytes,
        heartbeat_interval_secs: hb_interval.as_secs(),
        idle_timeout_secs: config.idle_timeout_secs,
    };
    let hello_frame = match Frame::with_meta(MsgType::Hello, 0, String::new(), &hello, Bytes::new())
    {
        Ok(frame) => frame,
        Err(e) => {
            error!(domain = %session.domain, error = %e, "failed to encode hello");
            teardown(&state, &session).await;
            return;
        }
    };
    if let Err(e) = session.send(hello_frame).await {
        warn!(domain = %session.domain, error = %e, "hello write failed");
        teardown(&state, &session).await;
        return;
    }

    session.set_state(SessionState::Connected);
    info!(
        domain = %session.domain,
        tunnel_id = tunnel.id,
        user_id = tunnel.user_id,
        ip = %client_ip,
        "agent connected"
    );
    state.audit.record(AuditEvent::new(
        "session.connected",
        tunnel.user_id,
        tunnel.id,
        &session.domain,
    ));

    tokio::spawn(watchdog(
        Arc::clone(&session),
        close_rx.clone(),
        idle_timeout,
        hb_interval,
    ));

    let max_payload = config.chunk_size_bytes + META_HEADROOM;
    loop {
        tokio::select! {
            maybe = stream.next() => {
                let msg = match maybe {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(domain = %session.domain, error = %e, "stream read error");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Binary(data) => {
                        session.touch();
                        match Frame::decode_with_limit(data, max_payload) {
                            Ok(frame) => {
                                if handle_frame(&session, frame).await.is_break() {
                                    break;
                                }
                            }
                            // An unknown discriminator is logged and dropped;
                            // anything else is a broken framing layer.
                            Err(ProtocolError::UnknownMsgType(t)) => {
                                warn!(domain = %session.domain, msg_type = t, "unknown envelope type dropped");
                            }
                            Err(e) => {
                                error!(domain = %session.domain, error = %e, "malformed envelope, closing session");
                                break;
                            }
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => session.touch(),
                    Message::Close(_) => {
                        debug!(domain = %session.domain, "agent closed stream");
                        break;
                    }
                    Message::Text(_) => {
                        debug!(domain = %session.domain, "ignoring text frame");
                    }
                }
            }
            _ = close_rx.changed() => break,
        }
    }

    teardown(&state, &session).await;
}

async fn handle_frame(session: &Arc<TunnelSession>, frame: Frame) -> ControlFlow<()> {
    match frame.msg_type {
        MsgType::Heartbeat => {
            if session
                .send(Frame::control(MsgType::Heartbeat, Bytes::new()))
                .await
                .is_err()
            {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }
        MsgType::HttpResponse | MsgType::LargeFileChunk | MsgType::Error => {
            if frame.request_id.is_empty() {
                warn!(domain = %session.domain, msg_type = ?frame.msg_type, "response envelope without request id dropped");
                return ControlFlow::Continue(());
            }
            match session.deliver(frame) {
                Deliver::Delivered => ControlFlow::Continue(()),
                Deliver::Unknown => {
                    debug!(domain = %session.domain, "dangling envelope for finished request dropped");
                    ControlFlow::Continue(())
                }
                Deliver::Overflow => {
                    error!(domain = %session.domain, "pending channel overflow, closing session");
                    ControlFlow::Break(())
                }
            }
        }
        other => {
            error!(domain = %session.domain, msg_type = ?other, "unexpected envelope direction, closing session");
            ControlFlow::Break(())
        }
    }
}

/// Liveness: fires on inbound silence, sends heartbeats while otherwise
/// idle. Chunks of in-flight transfers refresh the clock, so long transfers
/// outlive the idle timeout.
async fn watchdog(
    session: Arc<TunnelSession>,
    mut close_rx: watch::Receiver<bool>,
    idle_timeout: Duration,
    hb_interval: Duration,
) {
    let tick = (hb_interval / 2).clamp(Duration::from_millis(500), Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = close_rx.changed() => return,
            _ = tokio::time::sleep(tick) => {
                let idle = session.idle();
                if idle >= idle_timeout {
                    warn!(
                        domain = %session.domain,
                        idle_secs = idle.as_secs(),
                        "session idle timeout, closing"
                    );
                    session.trigger_close();
                    return;
                }
                if idle >= hb_interval
                    && session
                        .send(Frame::control(MsgType::Heartbeat, Bytes::new()))
                        .await
                        .is_err()
                {
                    // send() already triggered the close.
                    return;
                }
            }
        }
    }
}

async fn teardown(state: &Arc<AppState>, session: &Arc<TunnelSession>) {
    session.begin_drain();
    let woken = session.mark_closed();
    state.registry.unregister(session);
    session.close_stream().await;
    if woken > 0 {
        warn!(domain = %session.domain, woken, "pending requests woken with disconnect");
    }

    // Clear the recorded agent IP unless a newer session already took over
    // the domain.
    let replaced = state
        .registry
        .lookup(&session.domain)
        .is_some_and(|current| !Arc::ptr_eq(&current, session));
    if !replaced {
        if let Err(e) = state.store.set_client_ip(session.tunnel_id, None).await {
            warn!(domain = %session.domain, error = %e, "failed to clear agent ip");
        }
    }

    state.audit.record(AuditEvent::new(
        "session.disconnected",
        session.user_id,
        session.tunnel_id,
        &session.domain,
    ));
    info!(domain = %session.domain, "agent disconnected");
}
