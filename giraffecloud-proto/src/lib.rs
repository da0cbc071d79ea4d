//! Wire protocol for the GiraffeCloud tunnel.
//!
//! The edge and the agent exchange discriminated binary envelopes over a
//! single bidirectional stream. Every envelope carries a request id (empty
//! for control traffic) and a millisecond timestamp, followed by a
//! variant-specific payload. Variants that describe an HTTP exchange embed
//! a JSON metadata block in front of the raw body bytes.

mod frame;
mod meta;

pub use frame::{flags, Frame, MsgType, ProtocolError, HEADER_SIZE};
pub use meta::{HelloMeta, RequestMeta, ResponseMeta};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default body chunk size for streamed transfers (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Requests or responses larger than this take the streaming path (16 MiB).
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Headroom on top of the chunk size for the JSON metadata block.
pub const META_HEADROOM: usize = 64 * 1024;

/// Suffix marking the terminal chunk of a chunked response.
pub const FINAL_CHUNK_SUFFIX: &str = "_final";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Request id generator: wall-clock millis plus a session-local counter,
/// so an id cannot repeat within a session lifetime.
#[derive(Debug, Default)]
pub struct RequestIdGen {
    counter: AtomicU64,
}

impl RequestIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", now_millis(), seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let generator = RequestIdGen::new();
        let a = generator.next_id();
        let b = generator.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn request_ids_carry_a_counter() {
        let generator = RequestIdGen::new();
        let id = generator.next_id();
        let (_, seq) = id.rsplit_once('-').unwrap();
        assert_eq!(seq, "0");
        let id = generator.next_id();
        assert!(id.ends_with("-1"));
    }
}
