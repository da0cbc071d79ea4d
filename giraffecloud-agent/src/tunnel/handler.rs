//! Per-request handler: executes the relayed request against the local
//! origin and sends response envelopes back through the writer channel.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use giraffecloud_proto::{flags, Frame, MsgType, RequestMeta, ResponseMeta, FINAL_CHUNK_SUFFIX};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::AgentState;

use super::writer::FrameTx;

/// Handle a `HttpRequest` or `LargeFileRequest` envelope: the whole request
/// is in hand, only the response may need chunking.
pub async fn handle_request(
    state: Arc<AgentState>,
    frame: Frame,
    frame_tx: FrameTx,
    chunk_size: usize,
) {
    let request_id = frame.request_id.clone();
    let force_chunked = frame.msg_type == MsgType::LargeFileRequest;

    let (meta, body): (RequestMeta, Bytes) = match frame.split_meta() {
        Ok(parts) => parts,
        Err(e) => {
            send_error(&frame_tx, &request_id, &format!("invalid request metadata: {e}")).await;
            return;
        }
    };
    // A LargeFileRequest may carry its own chunk-size suggestion.
    let chunk_size = if meta.chunk_size > 0 {
        (meta.chunk_size as usize).min(chunk_size)
    } else {
        chunk_size
    };

    let body = (!body.is_empty()).then(|| reqwest::Body::from(body));
    let response = match execute(&state, &meta, body).await {
        Ok(response) => response,
        Err(reason) => {
            send_error(&frame_tx, &request_id, &reason).await;
            return;
        }
    };
    respond(&frame_tx, &request_id, response, chunk_size, force_chunked).await;
}

/// Handle a streamed upload: `HttpRequestStart` arrived, body chunks follow
/// on `body_rx` until the end marker.
pub async fn handle_upload(
    state: Arc<AgentState>,
    start_frame: Frame,
    body_rx: mpsc::Receiver<Frame>,
    frame_tx: FrameTx,
    chunk_size: usize,
) {
    let request_id = start_frame.request_id.clone();
    let (meta, _): (RequestMeta, Bytes) = match start_frame.split_meta() {
        Ok(parts) => parts,
        Err(e) => {
            send_error(&frame_tx, &request_id, &format!("invalid request metadata: {e}")).await;
            return;
        }
    };

    // Feed body chunks straight into the origin request. A channel that
    // closes without the end marker is an aborted upload and must fail the
    // origin request rather than truncate it silently.
    let body_stream = futures_util::stream::unfold((body_rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        match rx.recv().await {
            Some(frame) if frame.msg_type == MsgType::HttpRequestChunk => {
                Some((Ok(frame.payload), (rx, false)))
            }
            Some(frame) if frame.msg_type == MsgType::HttpRequestEnd => None,
            Some(frame) => Some((
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected envelope {:?} in upload body", frame.msg_type),
                )),
                (rx, true),
            )),
            None => Some((
                Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "upload aborted before the end marker",
                )),
                (rx, true),
            )),
        }
    });

    let response = match execute(&state, &meta, Some(reqwest::Body::wrap_stream(body_stream))).await
    {
        Ok(response) => response,
        Err(reason) => {
            send_error(&frame_tx, &request_id, &reason).await;
            return;
        }
    };
    respond(&frame_tx, &request_id, response, chunk_size, false).await;
}

/// Execute the relayed request against the local origin.
async fn execute(
    state: &AgentState,
    meta: &RequestMeta,
    body: Option<reqwest::Body>,
) -> Result<reqwest::Response, String> {
    let url = format!("{}{}", state.origin_base, meta.path);
    let method = reqwest::Method::from_bytes(meta.method.as_bytes())
        .map_err(|_| format!("invalid method {:?}", meta.method))?;

    let mut request = state.client.request(method, &url);
    for (name, value) in &meta.headers {
        // The origin sees its own host; the public one rides along in
        // X-Forwarded-Host.
        if name.eq_ignore_ascii_case("host") {
            request = request.header("x-forwarded-host", value.as_str());
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        request = request.header(name.as_str(), value.as_str());
    }
    if !meta.client_ip.is_empty() {
        request = request.header("x-forwarded-for", meta.client_ip.as_str());
    }
    request = request.timeout(Duration::from_secs(state.config.origin_timeout_secs));
    if let Some(body) = body {
        request = request.body(body);
    }

    request.send().await.map_err(|e| {
        if e.is_timeout() {
            "origin timeout".to_string()
        } else if e.is_connect() {
            format!("origin connect error: {e}")
        } else {
            format!("origin error: {e}")
        }
    })
}

/// Send the origin's response back: one full envelope when it is small and
/// sized, a chunked sequence otherwise. The terminal chunk id carries the
/// `_final` suffix and the end-stream flag.
async fn respond(
    frame_tx: &FrameTx,
    request_id: &str,
    response: reqwest::Response,
    chunk_size: usize,
    force_chunked: bool,
) {
    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("").to_string();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let content_length = response.content_length();
    let chunked = force_chunked || content_length.map_or(true, |len| len > chunk_size as u64);

    if !chunked {
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                send_error(frame_tx, request_id, &format!("origin body read error: {e}")).await;
                return;
            }
        };
        let meta = ResponseMeta {
            status: status.as_u16(),
            status_text,
            headers,
            is_chunked: false,
            chunk_id: None,
        };
        send_meta_frame(frame_tx, request_id, &meta, body, flags::END_STREAM).await;
        debug!(request_id, status = status.as_u16(), "request completed");
        return;
    }

    // Head envelope: status and headers open the body stream.
    let head = ResponseMeta {
        status: status.as_u16(),
        status_text,
        headers,
        is_chunked: true,
        chunk_id: Some("0".to_string()),
    };
    send_meta_frame(frame_tx, request_id, &head, Bytes::new(), 0).await;

    let mut stream = response.bytes_stream();
    let mut buf = BytesMut::new();
    let mut seq: u64 = 0;
    while let Some(next) = stream.next().await {
        let data = match next {
            Ok(data) => data,
            Err(e) => {
                warn!(request_id, error = %e, "origin body read error mid-stream");
                send_error(frame_tx, request_id, &format!("origin body read error: {e}")).await;
                return;
            }
        };
        buf.extend_from_slice(&data);
        while buf.len() >= chunk_size {
            seq += 1;
            let chunk = buf.split_to(chunk_size).freeze();
            if send_chunk(frame_tx, request_id, seq.to_string(), chunk, 0)
                .await
                .is_err()
            {
                return;
            }
        }
    }
    if !buf.is_empty() {
        seq += 1;
        if send_chunk(frame_tx, request_id, seq.to_string(), buf.freeze(), 0)
            .await
            .is_err()
        {
            return;
        }
    }

    // Terminal marker.
    seq += 1;
    let _ = send_chunk(
        frame_tx,
        request_id,
        format!("{seq}{FINAL_CHUNK_SUFFIX}"),
        Bytes::new(),
        flags::END_STREAM,
    )
    .await;
    debug!(request_id, status = status.as_u16(), chunks = seq, "streamed response completed");
}

async fn send_chunk(
    frame_tx: &FrameTx,
    request_id: &str,
    chunk_id: String,
    payload: Bytes,
    frame_flags: u8,
) -> Result<(), ()> {
    let meta = ResponseMeta {
        status: 0,
        status_text: String::new(),
        headers: Vec::new(),
        is_chunked: true,
        chunk_id: Some(chunk_id),
    };
    send_meta_frame_result(frame_tx, request_id, &meta, payload, frame_flags).await
}

async fn send_meta_frame(
    frame_tx: &FrameTx,
    request_id: &str,
    meta: &ResponseMeta,
    payload: Bytes,
    frame_flags: u8,
) {
    let _ = send_meta_frame_result(frame_tx, request_id, meta, payload, frame_flags).await;
}

async fn send_meta_frame_result(
    frame_tx: &FrameTx,
    request_id: &str,
    meta: &ResponseMeta,
    payload: Bytes,
    frame_flags: u8,
) -> Result<(), ()> {
    let frame = match Frame::with_meta(MsgType::HttpResponse, frame_flags, request_id, meta, payload)
    {
        Ok(frame) => frame,
        Err(e) => {
            warn!(request_id, error = %e, "failed to encode response envelope");
            return Err(());
        }
    };
    frame_tx.send(frame).await.map_err(|_| ())
}

async fn send_error(frame_tx: &FrameTx, request_id: &str, reason: &str) {
    warn!(request_id, reason, "request failed");
    let _ = frame_tx.send(Frame::error(request_id, reason)).await;
}
