//! Chunked-response collector.
//!
//! The first response envelope carries status and headers and opens the body
//! stream; continuation envelopes carry body bytes; the terminal chunk is
//! marked by the `_final` chunk-id suffix or the `END_STREAM` flag. Bytes
//! stream onward to the public client through a bounded pipe without
//! buffering the full body, and every chunk refreshes the session's
//! liveness clock.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use giraffecloud_proto::{Frame, MsgType, ResponseMeta};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::Error;
use crate::session::{PendingGuard, TunnelSession};
use crate::usage::UsageTracker;

/// Depth of the pipe feeding the public client. Small on purpose: a slow
/// reader backpressures the collector, which stops draining the pending
/// channel, which ultimately stalls the agent's producer.
const BODY_PIPE_DEPTH: usize = 16;

#[derive(Clone)]
pub struct CollectorConfig {
    pub metadata_timeout: Duration,
    pub chunk_timeout: Duration,
}

/// Usage attribution for one request; fires exactly once on completion.
pub struct MeterContext {
    pub usage: Arc<UsageTracker>,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub domain: String,
    pub bytes_in: u64,
}

impl MeterContext {
    fn complete(&self, bytes_out: u64) {
        self.usage.increment(
            self.user_id,
            self.tunnel_id,
            &self.domain,
            self.bytes_in,
            bytes_out,
            1,
        );
    }
}

#[derive(Debug)]
pub enum Collected {
    Full { meta: ResponseMeta, body: Bytes },
    Streamed { meta: ResponseMeta, body: Body },
}

/// Await the correlated response for one request.
///
/// Owns the pending guard: for a full response the entry is released before
/// returning; for a chunked response the pump task carries the guard so the
/// entry outlives this call exactly as long as chunks are still expected.
pub async fn collect(
    mut rx: mpsc::Receiver<Frame>,
    session: Arc<TunnelSession>,
    guard: PendingGuard,
    meter: MeterContext,
    config: CollectorConfig,
) -> Result<Collected, Error> {
    let first = match timeout(config.metadata_timeout, rx.recv()).await {
        Err(_) => {
            return Err(Error::Timeout(format!(
                "no response metadata within {}s",
                config.metadata_timeout.as_secs()
            )))
        }
        Ok(None) => {
            return Err(Error::Disconnected(
                "session closed before a response arrived".into(),
            ))
        }
        Ok(Some(frame)) => frame,
    };

    match first.msg_type {
        MsgType::Error => {
            let reason = String::from_utf8_lossy(&first.payload).into_owned();
            Err(Error::Upstream(reason))
        }
        MsgType::HttpResponse => {
            let (meta, body): (ResponseMeta, Bytes) = first.split_meta()?;
            if !meta.is_chunked {
                meter.complete(body.len() as u64);
                drop(guard);
                return Ok(Collected::Full { meta, body });
            }

            let finished = first.is_end_stream() || meta.is_final();
            let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, io::Error>>(BODY_PIPE_DEPTH);
            tokio::spawn(pump(
                rx, session, guard, meter, config, body_tx, body, finished,
            ));
            Ok(Collected::Streamed {
                meta,
                body: Body::from_stream(ReceiverStream::new(body_rx)),
            })
        }
        other => Err(Error::ProtocolViolation(format!(
            "expected a response envelope, got {other:?}"
        ))),
    }
}

/// Drain continuation envelopes into the body pipe until the terminal
/// marker, a timeout, a disconnect, or the client going away. Every exit
/// path releases the pending entry via the guard.
#[allow(clippy::too_many_arguments)]
async fn pump(
    mut rx: mpsc::Receiver<Frame>,
    session: Arc<TunnelSession>,
    guard: PendingGuard,
    meter: MeterContext,
    config: CollectorConfig,
    body_tx: mpsc::Sender<Result<Bytes, io::Error>>,
    initial: Bytes,
    mut finished: bool,
) {
    let request_id = guard.request_id().to_string();
    let mut bytes_out = initial.len() as u64;
    if !initial.is_empty() && body_tx.send(Ok(initial)).await.is_err() {
        debug!(%request_id, "client went away before the body started");
        return;
    }
    if finished {
        meter.complete(bytes_out);
        return;
    }

    while !finished {
        let frame = match timeout(config.chunk_timeout, rx.recv()).await {
            Err(_) => {
                warn!(%request_id, "inter-chunk timeout");
                let _ = body_tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "inter-chunk timeout on tunnel stream",
                    )))
                    .await;
                return;
            }
            Ok(None) => {
                let _ = body_tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "tunnel disconnected mid-response",
                    )))
                    .await;
                return;
            }
            Ok(Some(frame)) => frame,
        };

        match frame.msg_type {
            MsgType::HttpResponse => {
                session.touch();
                let (meta, chunk): (ResponseMeta, Bytes) = match frame.split_meta() {
                    Ok(parts) => parts,
                    Err(e) => {
                        warn!(%request_id, error = %e, "bad continuation envelope, terminating session");
                        session.trigger_close();
                        let _ = body_tx
                            .send(Err(io::Error::new(io::ErrorKind::InvalidData, e)))
                            .await;
                        return;
                    }
                };
                finished = frame.is_end_stream() || meta.is_final();
                if !chunk.is_empty() {
                    bytes_out += chunk.len() as u64;
                    if body_tx.send(Ok(chunk)).await.is_err() {
                        debug!(%request_id, "client cancelled mid-stream");
                        return;
                    }
                }
            }
            MsgType::Error => {
                let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                let _ = body_tx
                    .send(Err(io::Error::other(format!("agent error: {reason}"))))
                    .await;
                return;
            }
            other => {
                warn!(%request_id, msg_type = ?other, "unexpected envelope mid-response, terminating session");
                session.trigger_close();
                let _ = body_tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected envelope mid-response",
                    )))
                    .await;
                return;
            }
        }
    }

    meter.complete(bytes_out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::detached_session;
    use crate::store::MemoryStore;
    use futures_util::StreamExt;
    use giraffecloud_proto::flags;

    fn meter(usage: &Arc<UsageTracker>) -> MeterContext {
        MeterContext {
            usage: Arc::clone(usage),
            user_id: 1,
            tunnel_id: 1,
            domain: "a.example".into(),
            bytes_in: 10,
        }
    }

    fn config() -> CollectorConfig {
        CollectorConfig {
            metadata_timeout: Duration::from_millis(200),
            chunk_timeout: Duration::from_millis(200),
        }
    }

    fn response_frame(id: &str, meta: &ResponseMeta, body: &str, end: bool) -> Frame {
        Frame::with_meta(
            MsgType::HttpResponse,
            if end { flags::END_STREAM } else { 0 },
            id,
            meta,
            Bytes::from(body.to_string()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn full_response_meters_and_releases() {
        let session = detached_session("a.example");
        let usage = Arc::new(UsageTracker::new(Arc::new(MemoryStore::new()), 1000));
        let (id, rx, guard) = session.begin_request().unwrap();

        let meta = ResponseMeta {
            status: 200,
            status_text: "OK".into(),
            headers: vec![],
            is_chunked: false,
            chunk_id: None,
        };
        session.deliver(response_frame(&id, &meta, "hello", false));

        let collected = collect(rx, Arc::clone(&session), guard, meter(&usage), config())
            .await
            .unwrap();
        match collected {
            Collected::Full { meta, body } => {
                assert_eq!(meta.status, 200);
                assert_eq!(&body[..], b"hello");
            }
            Collected::Streamed { .. } => panic!("expected a full response"),
        }
        assert_eq!(session.pending_len(), 0);
        let totals = usage.pending_today(1);
        assert_eq!(totals.bytes_in, 10);
        assert_eq!(totals.bytes_out, 5);
        assert_eq!(totals.requests, 1);
    }

    #[tokio::test]
    async fn metadata_timeout_is_reported() {
        let session = detached_session("b.example");
        let usage = Arc::new(UsageTracker::new(Arc::new(MemoryStore::new()), 1000));
        let (_id, rx, guard) = session.begin_request().unwrap();

        let err = collect(rx, Arc::clone(&session), guard, meter(&usage), config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(session.pending_len(), 0);
        assert_eq!(usage.pending_today(1).requests, 0);
    }

    #[tokio::test]
    async fn disconnect_before_response_is_reported() {
        let session = detached_session("c.example");
        let usage = Arc::new(UsageTracker::new(Arc::new(MemoryStore::new()), 1000));
        let (_id, rx, guard) = session.begin_request().unwrap();

        session.mark_closed();
        let err = collect(rx, Arc::clone(&session), guard, meter(&usage), config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }

    #[tokio::test]
    async fn agent_error_envelope_surfaces_reason() {
        let session = detached_session("d.example");
        let usage = Arc::new(UsageTracker::new(Arc::new(MemoryStore::new()), 1000));
        let (id, rx, guard) = session.begin_request().unwrap();

        session.deliver(Frame::error(&id, "origin connect refused"));
        let err = collect(rx, Arc::clone(&session), guard, meter(&usage), config())
            .await
            .unwrap_err();
        match err {
            Error::Upstream(reason) => assert!(reason.contains("origin connect refused")),
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunked_response_streams_in_order_until_final() {
        let session = detached_session("e.example");
        let usage = Arc::new(UsageTracker::new(Arc::new(MemoryStore::new()), 1000));
        let (id, rx, guard) = session.begin_request().unwrap();

        let head = ResponseMeta {
            status: 200,
            status_text: "OK".into(),
            headers: vec![("content-type".into(), "video/mp4".into())],
            is_chunked: true,
            chunk_id: Some("0".into()),
        };
        session.deliver(response_frame(&id, &head, "", false));
        let cont = |n: &str| ResponseMeta {
            status: 0,
            status_text: String::new(),
            headers: vec![],
            is_chunked: true,
            chunk_id: Some(n.to_string()),
        };
        session.deliver(response_frame(&id, &cont("1"), "aaa", false));
        session.deliver(response_frame(&id, &cont("2"), "bbb", false));
        session.deliver(response_frame(&id, &cont("3_final"), "", true));

        let collected = collect(rx, Arc::clone(&session), guard, meter(&usage), config())
            .await
            .unwrap();
        let Collected::Streamed { meta, body } = collected else {
            panic!("expected a streamed response");
        };
        assert_eq!(meta.status, 200);

        let mut stream = body.into_data_stream();
        let mut collected_body = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected_body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected_body, b"aaabbb");
        assert_eq!(session.pending_len(), 0);
        assert_eq!(usage.pending_today(1).bytes_out, 6);
    }
}
