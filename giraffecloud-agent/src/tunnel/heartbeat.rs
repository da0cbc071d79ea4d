//! Proactive heartbeats.
//!
//! Sent on a fixed cadence whether or not requests are in flight, so the
//! edge sees inbound activity even while it is pushing a long upload at us.
//! The interval starts from config and is updated by the edge hello.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use giraffecloud_proto::{Frame, MsgType};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::writer::FrameTx;

/// Interval in seconds, shared with the dispatcher which applies the hello.
pub type IntervalHandle = Arc<AtomicU64>;

pub fn spawn(
    frame_tx: FrameTx,
    interval_secs: IntervalHandle,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = Duration::from_secs(interval_secs.load(Ordering::Acquire).max(1));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if frame_tx
                        .send(Frame::control(MsgType::Heartbeat, Bytes::new()))
                        .await
                        .is_err()
                    {
                        break; // Writer closed
                    }
                    debug!("sent heartbeat");
                }
                _ = shutdown.changed() => {
                    debug!("heartbeat task shutting down");
                    break;
                }
            }
        }
    })
}
