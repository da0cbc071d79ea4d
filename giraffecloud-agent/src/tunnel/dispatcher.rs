//! Envelope dispatcher: reads the tunnel stream and routes envelopes.
//!
//! Unary requests and downloads spawn a handler per request id. Streamed
//! uploads get a body channel the dispatcher feeds chunk by chunk until the
//! end marker arrives.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use giraffecloud_proto::{
    Frame, HelloMeta, MsgType, DEFAULT_CHUNK_SIZE, META_HEADROOM,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::state::AgentState;

use super::handler;
use super::heartbeat::IntervalHandle;
use super::writer::FrameTx;

/// Depth of each upload body channel.
const UPLOAD_CHANNEL_DEPTH: usize = 64;

/// Run the dispatcher loop, reading from the tunnel stream.
pub async fn run<S>(
    state: Arc<AgentState>,
    mut ws_stream: S,
    frame_tx: FrameTx,
    hb_interval: IntervalHandle,
) -> Result<(), anyhow::Error>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
{
    // Streamed uploads in progress: request id -> body sender.
    let mut uploads: HashMap<String, mpsc::Sender<Frame>> = HashMap::new();
    let mut handler_handles: Vec<JoinHandle<()>> = Vec::new();
    let mut chunk_size: usize = DEFAULT_CHUNK_SIZE;
    let mut frames_since_cleanup: u32 = 0;
    let stale_timeout = Duration::from_secs(state.config.stale_timeout_secs);

    // Track the last time anything arrived to detect stale connections.
    let mut last_data_at = tokio::time::Instant::now();

    let read_err = loop {
        let msg_result = tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(r) => r,
                    None => break None,
                }
            }
            _ = tokio::time::sleep_until(last_data_at + stale_timeout) => {
                warn!(
                    stale_secs = stale_timeout.as_secs(),
                    "tunnel connection stale, no data received"
                );
                break None;
            }
        };

        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "tunnel stream read error");
                break Some(e);
            }
        };

        last_data_at = tokio::time::Instant::now();

        let data = match msg {
            Message::Binary(data) => Bytes::from(data),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                info!("edge closed the stream");
                break None;
            }
            _ => continue,
        };

        let frame = match Frame::decode_with_limit(data, chunk_size + META_HEADROOM) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to decode envelope");
                continue;
            }
        };

        match frame.msg_type {
            MsgType::Hello => match frame.split_meta::<HelloMeta>() {
                Ok((hello, _)) => {
                    if hello.chunk_size > 0 {
                        chunk_size = hello.chunk_size as usize;
                    }
                    if hello.heartbeat_interval_secs > 0 {
                        hb_interval.store(hello.heartbeat_interval_secs, Ordering::Release);
                    }
                    info!(
                        chunk_size,
                        heartbeat_secs = hello.heartbeat_interval_secs,
                        idle_timeout_secs = hello.idle_timeout_secs,
                        "received hello"
                    );
                }
                Err(e) => warn!(error = %e, "invalid hello metadata"),
            },

            MsgType::Heartbeat => {
                // Edge heartbeats (and replies to ours) only prove liveness;
                // answering them would ping-pong forever.
                debug!("heartbeat from edge");
            }

            MsgType::HttpRequest | MsgType::LargeFileRequest => {
                let state_clone = Arc::clone(&state);
                let tx_clone = frame_tx.clone();
                let handle = tokio::spawn(async move {
                    handler::handle_request(state_clone, frame, tx_clone, chunk_size).await;
                });
                handler_handles.push(handle);
            }

            MsgType::HttpRequestStart => {
                let (body_tx, body_rx) = mpsc::channel::<Frame>(UPLOAD_CHANNEL_DEPTH);
                uploads.insert(frame.request_id.clone(), body_tx);

                let state_clone = Arc::clone(&state);
                let tx_clone = frame_tx.clone();
                let handle = tokio::spawn(async move {
                    handler::handle_upload(state_clone, frame, body_rx, tx_clone, chunk_size)
                        .await;
                });
                handler_handles.push(handle);
                debug!("upload stream started");
            }

            MsgType::HttpRequestChunk => {
                if let Some(tx) = uploads.get(&frame.request_id) {
                    let _ = tx.send(frame).await;
                }
            }

            MsgType::HttpRequestEnd => {
                if let Some(tx) = uploads.remove(&frame.request_id) {
                    let _ = tx.send(frame).await;
                }
            }

            MsgType::Error => {
                // The edge gave up on this request; abort any upload feed.
                uploads.remove(&frame.request_id);
            }

            other => {
                debug!(msg_type = ?other, "ignoring unexpected envelope type");
            }
        }

        // Periodically clean up finished handles to avoid unbounded growth.
        frames_since_cleanup += 1;
        if frames_since_cleanup >= 64 {
            handler_handles.retain(|h| !h.is_finished());
            frames_since_cleanup = 0;
        }
    };

    // Drop body senders so upload handlers waiting on their channel unblock.
    uploads.clear();

    // Wait for active handlers so their frame_tx clones drop before the
    // writer closes the sink.
    drain_handlers(handler_handles).await;

    match read_err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Wait for all active request handlers to finish (with a timeout).
async fn drain_handlers(handles: Vec<JoinHandle<()>>) {
    let handles: Vec<_> = handles.into_iter().filter(|h| !h.is_finished()).collect();
    if handles.is_empty() {
        return;
    }
    debug!(count = handles.len(), "waiting for active request handlers");
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;
}
