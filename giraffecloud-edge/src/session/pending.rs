//! Pending-request table: one correlation entry per in-flight public
//! request, each with a bounded channel the receive loop pushes response
//! envelopes into.
//!
//! Channel closure is single-owner by construction: whichever of
//! {dispatcher exit, session teardown} removes the entry first drops the
//! sender, and removal happens under the table lock.

use std::collections::HashMap;

use giraffecloud_proto::Frame;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Capacity of each per-request channel. Sized to absorb chunk bursts;
/// overflow is a protocol violation that terminates the session.
pub const PENDING_CHANNEL_CAPACITY: usize = 256;

/// Outcome of delivering an inbound envelope to a pending entry.
#[derive(Debug, PartialEq, Eq)]
pub enum Deliver {
    Delivered,
    /// No entry for this request id (completed or cancelled); the envelope
    /// is dropped.
    Unknown,
    /// The entry's channel is full; the agent is violating flow control.
    Overflow,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, mpsc::Sender<Frame>>,
    draining: bool,
}

#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a correlation entry. Fails once the session is draining.
    pub fn insert(&self, request_id: &str) -> Option<mpsc::Receiver<Frame>> {
        let mut inner = self.inner.lock();
        if inner.draining {
            return None;
        }
        let (tx, rx) = mpsc::channel(PENDING_CHANNEL_CAPACITY);
        inner.map.insert(request_id.to_string(), tx);
        Some(rx)
    }

    /// Remove an entry, closing its channel exactly once. Idempotent.
    pub fn remove(&self, request_id: &str) -> bool {
        self.inner.lock().map.remove(request_id).is_some()
    }

    /// Push an envelope onto the entry's channel without blocking.
    pub fn deliver(&self, frame: Frame) -> Deliver {
        let inner = self.inner.lock();
        let Some(tx) = inner.map.get(&frame.request_id) else {
            return Deliver::Unknown;
        };
        match tx.try_send(frame) {
            Ok(()) => Deliver::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Deliver::Overflow,
            // Receiver already dropped; removal is racing us.
            Err(mpsc::error::TrySendError::Closed(_)) => Deliver::Unknown,
        }
    }

    /// Stop accepting new entries.
    pub fn set_draining(&self) {
        self.inner.lock().draining = true;
    }

    /// Drop every entry. Waiting collectors observe a closed channel and
    /// surface `Disconnected`.
    pub fn fail_all(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.draining = true;
        let count = inner.map.len();
        inner.map.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use giraffecloud_proto::{Frame, MsgType};

    fn response_for(id: &str) -> Frame {
        Frame::new(MsgType::HttpResponse, 0, id, bytes::Bytes::new())
    }

    #[tokio::test]
    async fn deliver_routes_by_request_id() {
        let table = PendingTable::new();
        let mut rx = table.insert("1-0").unwrap();

        assert_eq!(table.deliver(response_for("1-0")), Deliver::Delivered);
        assert_eq!(table.deliver(response_for("9-9")), Deliver::Unknown);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.request_id, "1-0");
    }

    #[tokio::test]
    async fn remove_closes_channel_exactly_once() {
        let table = PendingTable::new();
        let mut rx = table.insert("1-0").unwrap();

        assert!(table.remove("1-0"));
        assert!(!table.remove("1-0"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn overflow_is_reported() {
        let table = PendingTable::new();
        let _rx = table.insert("1-0").unwrap();
        for _ in 0..PENDING_CHANNEL_CAPACITY {
            assert_eq!(table.deliver(response_for("1-0")), Deliver::Delivered);
        }
        assert_eq!(table.deliver(response_for("1-0")), Deliver::Overflow);
    }

    #[tokio::test]
    async fn fail_all_wakes_every_waiter_and_blocks_new_entries() {
        let table = PendingTable::new();
        let mut rx_a = table.insert("1-0").unwrap();
        let mut rx_b = table.insert("1-1").unwrap();

        assert_eq!(table.fail_all(), 2);
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
        assert!(table.insert("1-2").is_none());
    }
}
