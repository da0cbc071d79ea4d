//! Dedicated stream writer task.
//!
//! All envelope writes go through an mpsc channel to a single writer task,
//! so request handlers and the heartbeat never contend on the sink.

use futures_util::SinkExt;
use giraffecloud_proto::Frame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

/// Sender half, cloned by request handlers and the heartbeat.
pub type FrameTx = mpsc::Sender<Frame>;

pub fn spawn_writer<S>(mut sink: S) -> (FrameTx, JoinHandle<()>)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(256);

    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let data = frame.encode();
            if let Err(e) = sink.send(Message::Binary(data.into())).await {
                error!(error = %e, "failed to write envelope to stream");
                break;
            }
        }
        debug!("writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}
