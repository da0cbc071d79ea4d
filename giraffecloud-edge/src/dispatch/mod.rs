//! Dispatcher: turns one public HTTP request into envelopes on the owning
//! session and the correlated response envelopes back into a public HTTP
//! response.
//!
//! Requests sharing a session are never serialized against each other; the
//! stream is multiplexed by request id. Timeouts are enforced per request,
//! so a slow request cannot poison its session.

pub mod classify;
pub mod collector;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State};
use axum::http::{header, request::Parts, HeaderName, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use giraffecloud_proto::{flags, Frame, MsgType, RequestMeta};
use tracing::{debug, warn};

use crate::dispatch::classify::{RequestProfile, TransportMode};
use crate::dispatch::collector::{Collected, CollectorConfig, MeterContext};
use crate::error::Error;
use crate::quota::QuotaDecision;
use crate::registry::normalize_domain;
use crate::session::TunnelSession;
use crate::state::AppState;

/// Header announcing a soft quota warning on proxied responses.
pub const QUOTA_WARNING_HEADER: &str = "x-giraffecloud-quota-warning";

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn ingress_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handle_public_request)
        .with_state(state)
}

pub async fn handle_public_request(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let Some(host) = effective_host(&req) else {
        return diagnostic(StatusCode::BAD_REQUEST, "missing host header".into());
    };
    let domain = normalize_domain(&host);
    match dispatch(&state, addr, &domain, req).await {
        Ok(response) => response,
        Err(err) => {
            debug!(domain = %domain, error = %err, "public request failed");
            public_error(&err, &domain)
        }
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    addr: SocketAddr,
    domain: &str,
    req: Request,
) -> Result<Response, Error> {
    let Some(session) = state.registry.lookup(domain) else {
        return Err(Error::TunnelOffline(format!(
            "no active tunnel for host {domain}"
        )));
    };
    if !session.is_connected() {
        return Err(Error::TunnelOffline(format!(
            "no active tunnel for host {domain}"
        )));
    }

    // Quota gate before any correlation state exists. Warn decisions only
    // annotate the response; backend faults were already resolved to allow.
    let quota = state.quota.check(session.user_id).await;
    if quota.decision == QuotaDecision::Block {
        return Err(Error::QuotaExceeded(format!(
            "monthly limit reached ({} of {} bytes)",
            quota.used_bytes, quota.limit_bytes
        )));
    }
    let warn_header =
        (quota.decision == QuotaDecision::Warn).then(|| format!("{}/{}", quota.used_bytes, quota.limit_bytes));

    let (parts, body) = req.into_parts();
    let client_ip = public_client_ip(&parts, addr);
    let content_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let mode = state.classifier.classify(&RequestProfile {
        method: &parts.method,
        path: parts.uri.path(),
        content_length,
    });

    let result = match mode {
        TransportMode::Unary => {
            dispatch_unary(state, &session, &parts, body, &client_ip, warn_header).await
        }
        TransportMode::StreamingUpload => {
            dispatch_upload(state, &session, &parts, body, &client_ip, warn_header).await
        }
        TransportMode::StreamingDownload => {
            dispatch_download(state, &session, &parts, body, &client_ip, warn_header).await
        }
    };

    // A protocol violation is not just this request's problem: the session
    // is no longer trustworthy.
    if let Err(Error::ProtocolViolation(reason)) = &result {
        warn!(domain = %session.domain, reason = %reason, "terminating session after protocol violation");
        session.trigger_close();
    }

    result
}

/// Public client IP: the fronting proxy's X-Forwarded-For when present,
/// otherwise the socket peer.
fn public_client_ip(parts: &Parts, addr: SocketAddr) -> String {
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

async fn dispatch_unary(
    state: &Arc<AppState>,
    session: &Arc<TunnelSession>,
    parts: &Parts,
    body: Body,
    client_ip: &str,
    warn_header: Option<String>,
) -> Result<Response, Error> {
    let limit = state.config.large_file_threshold_bytes as usize;
    let body_bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| Error::Validation(format!("failed to read request body: {e}")))?;

    let Some((id, rx, guard)) = session.begin_request() else {
        return Err(Error::TunnelOffline(format!(
            "no active tunnel for host {}",
            session.domain
        )));
    };
    let meta = request_meta(parts, client_ip, false, 0);
    let frame = Frame::with_meta(MsgType::HttpRequest, 0, id.as_str(), &meta, body_bytes.clone())?;
    session.send(frame).await?;

    let meter = meter_for(state, session, body_bytes.len() as u64);
    let collected = collector::collect(
        rx,
        Arc::clone(session),
        guard,
        meter,
        collector_config(state),
    )
    .await?;
    Ok(build_response(collected, warn_header))
}

async fn dispatch_upload(
    state: &Arc<AppState>,
    session: &Arc<TunnelSession>,
    parts: &Parts,
    body: Body,
    client_ip: &str,
    warn_header: Option<String>,
) -> Result<Response, Error> {
    let chunk_size = state.config.chunk_size_bytes;
    let Some((id, rx, guard)) = session.begin_request() else {
        return Err(Error::TunnelOffline(format!(
            "no active tunnel for host {}",
            session.domain
        )));
    };

    let meta = request_meta(parts, client_ip, true, chunk_size as u64);
    session
        .send(Frame::with_meta(
            MsgType::HttpRequestStart,
            0,
            id.as_str(),
            &meta,
            Bytes::new(),
        )?)
        .await?;

    // Relay the public body as fixed-size chunks, flushing whenever a full
    // chunk is buffered. A client abort drops the guard on the way out, so
    // no further chunks are sent and the pending entry is released.
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    let mut bytes_in: u64 = 0;
    while let Some(next) = stream.next().await {
        let data = next.map_err(|e| Error::Internal(format!("client body read failed: {e}")))?;
        bytes_in += data.len() as u64;
        buf.extend_from_slice(&data);
        while buf.len() >= chunk_size {
            let chunk = buf.split_to(chunk_size).freeze();
            session
                .send(Frame::new(MsgType::HttpRequestChunk, 0, id.clone(), chunk))
                .await?;
        }
    }
    if !buf.is_empty() {
        session
            .send(Frame::new(
                MsgType::HttpRequestChunk,
                0,
                id.clone(),
                buf.freeze(),
            ))
            .await?;
    }
    session
        .send(Frame::new(
            MsgType::HttpRequestEnd,
            flags::END_STREAM,
            id.clone(),
            Bytes::new(),
        ))
        .await?;

    let meter = meter_for(state, session, bytes_in);
    let collected = collector::collect(
        rx,
        Arc::clone(session),
        guard,
        meter,
        collector_config(state),
    )
    .await?;
    Ok(build_response(collected, warn_header))
}

async fn dispatch_download(
    state: &Arc<AppState>,
    session: &Arc<TunnelSession>,
    parts: &Parts,
    body: Body,
    client_ip: &str,
    warn_header: Option<String>,
) -> Result<Response, Error> {
    // Download-path requests carry at most a token body.
    let body_bytes = axum::body::to_bytes(body, state.config.chunk_size_bytes)
        .await
        .map_err(|e| Error::Validation(format!("failed to read request body: {e}")))?;

    let Some((id, rx, guard)) = session.begin_request() else {
        return Err(Error::TunnelOffline(format!(
            "no active tunnel for host {}",
            session.domain
        )));
    };
    let meta = request_meta(
        parts,
        client_ip,
        true,
        state.config.chunk_size_bytes as u64,
    );
    session
        .send(Frame::with_meta(
            MsgType::LargeFileRequest,
            0,
            id.as_str(),
            &meta,
            body_bytes.clone(),
        )?)
        .await?;

    let meter = meter_for(state, session, body_bytes.len() as u64);
    let collected = collector::collect(
        rx,
        Arc::clone(session),
        guard,
        meter,
        collector_config(state),
    )
    .await?;
    Ok(build_response(collected, warn_header))
}

fn meter_for(state: &Arc<AppState>, session: &Arc<TunnelSession>, bytes_in: u64) -> MeterContext {
    MeterContext {
        usage: Arc::clone(&state.usage),
        user_id: session.user_id,
        tunnel_id: session.tunnel_id,
        domain: session.domain.clone(),
        bytes_in,
    }
}

fn collector_config(state: &Arc<AppState>) -> CollectorConfig {
    CollectorConfig {
        metadata_timeout: Duration::from_secs(state.config.response_metadata_timeout_secs),
        chunk_timeout: Duration::from_secs(state.config.inter_chunk_timeout_secs),
    }
}

fn request_meta(parts: &Parts, client_ip: &str, large_file: bool, chunk_size: u64) -> RequestMeta {
    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    RequestMeta {
        method: parts.method.to_string(),
        path,
        headers,
        client_ip: client_ip.to_string(),
        large_file,
        chunk_size,
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn build_response(collected: Collected, warn_header: Option<String>) -> Response {
    match collected {
        Collected::Full { meta, body } => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(meta.status).unwrap_or(StatusCode::BAD_GATEWAY));
            for (name, value) in &meta.headers {
                if !is_hop_by_hop(name) {
                    builder = builder.header(name, value);
                }
            }
            if let Some(warning) = warn_header {
                builder = builder.header(HeaderName::from_static(QUOTA_WARNING_HEADER), warning);
            }
            builder
                .body(Body::from(body))
                .unwrap_or_else(|_| diagnostic(StatusCode::BAD_GATEWAY, "invalid upstream response".into()))
        }
        Collected::Streamed { meta, body } => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(meta.status).unwrap_or(StatusCode::BAD_GATEWAY));
            for (name, value) in &meta.headers {
                // Content-Length is replaced by chunked framing on streamed
                // downloads.
                if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                    continue;
                }
                builder = builder.header(name, value);
            }
            if let Some(warning) = warn_header {
                builder = builder.header(HeaderName::from_static(QUOTA_WARNING_HEADER), warning);
            }
            builder
                .body(body)
                .unwrap_or_else(|_| diagnostic(StatusCode::BAD_GATEWAY, "invalid upstream response".into()))
        }
    }
}

fn effective_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

/// Small plain-text diagnostic for public tunnel traffic.
fn diagnostic(status: StatusCode, reason: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(reason))
        .expect("static response parts are valid")
}

fn public_error(err: &Error, domain: &str) -> Response {
    let reason = match err {
        Error::TunnelOffline(_) => format!("no active tunnel for host {domain}"),
        other => format!("{other} (host {domain})"),
    };
    diagnostic(err.status(), reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("host"));
    }

    #[test]
    fn streamed_response_strips_content_length() {
        let meta = giraffecloud_proto::ResponseMeta {
            status: 200,
            status_text: "OK".into(),
            headers: vec![
                ("content-length".into(), "123456".into()),
                ("content-type".into(), "video/mp4".into()),
            ],
            is_chunked: true,
            chunk_id: Some("0".into()),
        };
        let response = build_response(
            Collected::Streamed {
                meta,
                body: Body::empty(),
            },
            None,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "video/mp4"
        );
    }

    #[test]
    fn warn_header_is_attached() {
        let meta = giraffecloud_proto::ResponseMeta {
            status: 200,
            status_text: "OK".into(),
            headers: vec![],
            is_chunked: false,
            chunk_id: None,
        };
        let response = build_response(
            Collected::Full {
                meta,
                body: Bytes::from("ok"),
            },
            Some("900/1000".into()),
        );
        assert_eq!(
            response.headers().get(QUOTA_WARNING_HEADER).unwrap(),
            "900/1000"
        );
    }

    #[test]
    fn public_error_names_the_host() {
        let err = Error::TunnelOffline("no active tunnel for host a.example".into());
        let response = public_error(&err, "a.example");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
