//! Per-agent tunnel session: owns the bidirectional stream, serializes
//! outbound writes, and demultiplexes inbound envelopes to pending requests.

pub mod handler;
pub mod pending;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use giraffecloud_proto::{now_millis, Frame, RequestIdGen};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::error::Error;
use crate::session::pending::{Deliver, PendingTable};

pub type SessionSink = SplitSink<WebSocket, Message>;

/// Session lifecycle. `Draining` accepts no new pending requests; existing
/// ones may complete within the drain window before forced close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Connected = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Handshaking,
            1 => Self::Connected,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

pub struct TunnelSession {
    pub tunnel_id: i64,
    pub user_id: i64,
    /// Domain as stored on the tunnel record (already normalized).
    pub domain: String,
    /// Observed agent IP at handshake.
    pub client_ip: String,

    state: AtomicU8,
    last_activity_ms: AtomicU64,
    sink: Mutex<Option<SessionSink>>,
    pending: PendingTable,
    ids: RequestIdGen,
    close_tx: watch::Sender<bool>,
    write_deadline: Duration,
}

impl TunnelSession {
    pub fn new(
        tunnel_id: i64,
        user_id: i64,
        domain: String,
        client_ip: String,
        sink: Option<SessionSink>,
        write_deadline: Duration,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        let session = Arc::new(Self {
            tunnel_id,
            user_id,
            domain,
            client_ip,
            state: AtomicU8::new(SessionState::Handshaking as u8),
            last_activity_ms: AtomicU64::new(now_millis()),
            sink: Mutex::new(sink),
            pending: PendingTable::new(),
            ids: RequestIdGen::new(),
            close_tx,
            write_deadline,
        });
        (session, close_rx)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Refresh the liveness clock. Every inbound envelope calls this; the
    /// watchdog times out on inbound silence only, so a peer that stops
    /// answering cannot be kept alive by our own writes.
    pub fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Release);
    }

    pub fn idle(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Serialize one envelope onto the stream. The stream is not safe for
    /// concurrent writers, so every send holds the session write lock. A
    /// send that outlives the write deadline declares the session broken.
    pub async fn send(&self, frame: Frame) -> Result<(), Error> {
        if self.state() == SessionState::Closed {
            return Err(Error::Disconnected(format!(
                "session for {} is closed",
                self.domain
            )));
        }
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(Error::Disconnected(format!(
                "session for {} has no stream",
                self.domain
            )));
        };
        let message = Message::Binary(frame.encode());
        match tokio::time::timeout(self.write_deadline, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                drop(guard);
                self.trigger_close();
                Err(Error::Disconnected(format!("stream write failed: {e}")))
            }
            Err(_) => {
                drop(guard);
                self.trigger_close();
                Err(Error::Timeout(format!(
                    "write deadline of {:?} exceeded for {}",
                    self.write_deadline, self.domain
                )))
            }
        }
    }

    /// Reserve a correlation entry for a new public request. `None` once the
    /// session is draining or closed.
    pub fn begin_request(self: &Arc<Self>) -> Option<(String, tokio::sync::mpsc::Receiver<Frame>, PendingGuard)> {
        if !self.is_connected() {
            return None;
        }
        let request_id = self.ids.next_id();
        let rx = self.pending.insert(&request_id)?;
        let guard = PendingGuard {
            session: Arc::clone(self),
            request_id: request_id.clone(),
        };
        Some((request_id, rx, guard))
    }

    /// Route an inbound envelope to its pending entry.
    pub fn deliver(&self, frame: Frame) -> Deliver {
        self.pending.deliver(frame)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Enter `Draining`: no new pending requests are accepted.
    pub fn begin_drain(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Connected as u8,
            SessionState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.pending.set_draining();
        debug!(domain = %self.domain, "session draining");
    }

    /// Ask the owning receive loop to shut the session down.
    pub fn trigger_close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Final teardown bookkeeping: mark closed and wake every pending
    /// request with a disconnect. Idempotent.
    pub fn mark_closed(&self) -> usize {
        self.set_state(SessionState::Closed);
        self.pending.fail_all()
    }

    /// Close the underlying stream, if still attached.
    pub async fn close_stream(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}

/// Removes the pending entry on drop, whatever exit path the dispatcher
/// takes. The entry's channel closes exactly once because removal goes
/// through the table lock.
pub struct PendingGuard {
    session: Arc<TunnelSession>,
    request_id: String,
}

impl PendingGuard {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.session.pending.remove(&self.request_id);
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Session without a stream, for registry and dispatch tests.
    pub fn detached_session(domain: &str) -> Arc<TunnelSession> {
        let (session, _rx) = TunnelSession::new(
            1,
            1,
            crate::registry::normalize_domain(domain),
            "127.0.0.1".into(),
            None,
            Duration::from_secs(5),
        );
        session.set_state(SessionState::Connected);
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use giraffecloud_proto::MsgType;

    #[tokio::test]
    async fn guard_removes_pending_entry_on_drop() {
        let session = test_support::detached_session("a.example");
        let (id, mut rx, guard) = session.begin_request().unwrap();
        assert_eq!(session.pending_len(), 1);

        drop(guard);
        assert_eq!(session.pending_len(), 0);
        assert!(rx.recv().await.is_none());

        // A late envelope for the removed id is dropped, not an error.
        let frame = Frame::new(MsgType::HttpResponse, 0, id, bytes::Bytes::new());
        assert_eq!(session.deliver(frame), Deliver::Unknown);
    }

    #[tokio::test]
    async fn draining_rejects_new_requests() {
        let session = test_support::detached_session("b.example");
        session.begin_drain();
        assert_eq!(session.state(), SessionState::Draining);
        assert!(session.begin_request().is_none());
    }

    #[tokio::test]
    async fn mark_closed_fails_pending() {
        let session = test_support::detached_session("c.example");
        let (_id, mut rx, _guard) = session.begin_request().unwrap();
        let woken = session.mark_closed();
        assert_eq!(woken, 1);
        assert!(rx.recv().await.is_none());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn send_without_stream_reports_disconnected() {
        let session = test_support::detached_session("d.example");
        let err = session
            .send(Frame::control(MsgType::Heartbeat, bytes::Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }
}
