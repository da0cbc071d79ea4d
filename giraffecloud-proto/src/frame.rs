//! Binary envelope framing.
//!
//! Envelope layout (16-byte fixed header + request id + variable payload):
//! ```text
//! | msg_type (1B) | flags (1B) | id_len (2B) | timestamp_ms (8B) | payload_len (4B) | request_id (NB) | payload (MB) |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{DEFAULT_CHUNK_SIZE, FINAL_CHUNK_SUFFIX, META_HEADROOM};

pub const HEADER_SIZE: usize = 16;

/// Envelope flags.
pub mod flags {
    /// Set on the terminal envelope of a chunked transfer.
    pub const END_STREAM: u8 = 0x01;
}

/// Envelope variants of the tunnel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Complete small request, edge to agent.
    HttpRequest = 0x01,
    /// Begin a streamed upload, edge to agent.
    HttpRequestStart = 0x02,
    /// Body chunk of a streamed upload.
    HttpRequestChunk = 0x03,
    /// End marker of a streamed upload.
    HttpRequestEnd = 0x04,
    /// Response, agent to edge. Full, or one chunk of a chunked response.
    HttpResponse = 0x05,
    /// Request for a known-large download, edge to agent.
    LargeFileRequest = 0x06,
    /// Reserved server-streaming download channel variant.
    LargeFileChunk = 0x07,
    /// Liveness probe, either direction.
    Heartbeat = 0x10,
    /// Terminates one pending request with a reason, agent to edge.
    Error = 0x11,
    /// Post-handshake greeting with negotiated parameters, edge to agent.
    Hello = 0x12,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::HttpRequest),
            0x02 => Some(Self::HttpRequestStart),
            0x03 => Some(Self::HttpRequestChunk),
            0x04 => Some(Self::HttpRequestEnd),
            0x05 => Some(Self::HttpResponse),
            0x06 => Some(Self::LargeFileRequest),
            0x07 => Some(Self::LargeFileChunk),
            0x10 => Some(Self::Heartbeat),
            0x11 => Some(Self::Error),
            0x12 => Some(Self::Hello),
            _ => None,
        }
    }
}

/// A single envelope on the tunnel stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MsgType,
    pub flags: u8,
    /// Opaque id correlating the envelope to a pending request. Empty for
    /// control traffic (heartbeats, hello).
    pub request_id: String,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(
        msg_type: MsgType,
        flags: u8,
        request_id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            msg_type,
            flags,
            request_id: request_id.into(),
            timestamp_ms: crate::now_millis(),
            payload: payload.into(),
        }
    }

    /// Control envelope (empty request id).
    pub fn control(msg_type: MsgType, payload: impl Into<Bytes>) -> Self {
        Self::new(msg_type, 0, String::new(), payload)
    }

    /// Error envelope terminating one pending request.
    pub fn error(request_id: impl Into<String>, reason: &str) -> Self {
        Self::new(
            MsgType::Error,
            0,
            request_id,
            Bytes::from(reason.as_bytes().to_vec()),
        )
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    /// Build a variant whose payload is a JSON metadata block followed by
    /// raw body bytes: `| meta_len (4B) | meta JSON | body |`.
    pub fn with_meta<T: Serialize>(
        msg_type: MsgType,
        flags: u8,
        request_id: impl Into<String>,
        meta: &T,
        body: impl Into<Bytes>,
    ) -> Result<Self, ProtocolError> {
        let meta_json = serde_json::to_vec(meta).map_err(ProtocolError::BadMeta)?;
        let body = body.into();
        let mut payload = BytesMut::with_capacity(4 + meta_json.len() + body.len());
        payload.put_u32(meta_json.len() as u32);
        payload.put_slice(&meta_json);
        payload.put(body);
        Ok(Self::new(msg_type, flags, request_id, payload.freeze()))
    }

    /// Split a composite payload into its metadata block and body bytes.
    pub fn split_meta<T: DeserializeOwned>(&self) -> Result<(T, Bytes), ProtocolError> {
        let mut payload = self.payload.clone();
        if payload.len() < 4 {
            return Err(ProtocolError::TooShort {
                expected: 4,
                actual: payload.len(),
            });
        }
        let meta_len = payload.get_u32() as usize;
        if payload.remaining() < meta_len {
            return Err(ProtocolError::Incomplete {
                expected: meta_len,
                actual: payload.remaining(),
            });
        }
        let meta_bytes = payload.split_to(meta_len);
        let meta = serde_json::from_slice(&meta_bytes).map_err(ProtocolError::BadMeta)?;
        Ok((meta, payload))
    }

    /// Encode into a binary buffer.
    pub fn encode(&self) -> Bytes {
        let id = self.request_id.as_bytes();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + id.len() + self.payload.len());
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.flags);
        buf.put_u16(id.len() as u16);
        buf.put_u64(self.timestamp_ms);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(id);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode with the default payload ceiling (chunk size plus metadata
    /// headroom).
    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        Self::decode_with_limit(data, DEFAULT_CHUNK_SIZE + META_HEADROOM)
    }

    /// Decode from a binary buffer, rejecting payloads above `max_payload`.
    pub fn decode_with_limit(mut data: Bytes, max_payload: usize) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let msg_type_raw = data.get_u8();
        let frame_flags = data.get_u8();
        let id_len = data.get_u16() as usize;
        let timestamp_ms = data.get_u64();
        let payload_len = data.get_u32() as usize;

        if payload_len > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                limit: max_payload,
                actual: payload_len,
            });
        }
        if data.remaining() < id_len + payload_len {
            return Err(ProtocolError::Incomplete {
                expected: HEADER_SIZE + id_len + payload_len,
                actual: HEADER_SIZE + data.remaining(),
            });
        }

        let msg_type =
            MsgType::from_u8(msg_type_raw).ok_or(ProtocolError::UnknownMsgType(msg_type_raw))?;
        let id_bytes = data.split_to(id_len);
        let request_id =
            String::from_utf8(id_bytes.to_vec()).map_err(|_| ProtocolError::BadRequestId)?;
        let payload = data.split_to(payload_len);

        Ok(Self {
            msg_type,
            flags: frame_flags,
            request_id,
            timestamp_ms,
            payload,
        })
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("envelope too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("envelope incomplete: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },
    #[error("payload exceeds limit: {actual} > {limit}")]
    PayloadTooLarge { limit: usize, actual: usize },
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMsgType(u8),
    #[error("request id is not valid UTF-8")]
    BadRequestId,
    #[error("invalid metadata block: {0}")]
    BadMeta(#[source] serde_json::Error),
}

/// True when a chunk id names the terminal chunk of a chunked response.
pub fn is_final_chunk_id(chunk_id: &str) -> bool {
    chunk_id.ends_with(FINAL_CHUNK_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResponseMeta;

    #[test]
    fn roundtrip_plain_frame() {
        let frame = Frame::new(MsgType::HttpRequestChunk, 0, "171-4", Bytes::from("abcdef"));
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.msg_type, MsgType::HttpRequestChunk);
        assert_eq!(decoded.request_id, "171-4");
        assert_eq!(decoded.timestamp_ms, frame.timestamp_ms);
        assert_eq!(&decoded.payload[..], b"abcdef");
    }

    #[test]
    fn roundtrip_control_frame() {
        let frame = Frame::control(MsgType::Heartbeat, Bytes::new());
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Heartbeat);
        assert!(decoded.request_id.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn roundtrip_meta_and_body() {
        let meta = ResponseMeta {
            status: 200,
            status_text: "OK".into(),
            headers: vec![("content-type".into(), "text/plain".into())],
            is_chunked: false,
            chunk_id: None,
        };
        let frame =
            Frame::with_meta(MsgType::HttpResponse, 0, "9-0", &meta, Bytes::from("hello")).unwrap();
        let decoded = Frame::decode(frame.encode()).unwrap();
        let (meta2, body): (ResponseMeta, Bytes) = decoded.split_meta().unwrap();
        assert_eq!(meta2.status, 200);
        assert_eq!(meta2.headers.len(), 1);
        assert_eq!(&body[..], b"hello");
    }

    #[test]
    fn end_stream_flag() {
        let frame = Frame::new(MsgType::HttpResponse, flags::END_STREAM, "1-1", Bytes::new());
        assert!(frame.is_end_stream());
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert!(decoded.is_end_stream());
    }

    #[test]
    fn rejects_truncated_buffer() {
        let frame = Frame::control(MsgType::Heartbeat, Bytes::from("xy"));
        let encoded = frame.encode();
        let truncated = encoded.slice(..encoded.len() - 1);
        assert!(matches!(
            Frame::decode(truncated),
            Err(ProtocolError::Incomplete { .. })
        ));
    }

    #[test]
    fn rejects_unknown_msg_type() {
        let frame = Frame::control(MsgType::Heartbeat, Bytes::new());
        let mut raw = frame.encode().to_vec();
        raw[0] = 0x7f;
        assert!(matches!(
            Frame::decode(Bytes::from(raw)),
            Err(ProtocolError::UnknownMsgType(0x7f))
        ));
    }

    #[test]
    fn rejects_oversized_payload() {
        let frame = Frame::new(
            MsgType::HttpRequestChunk,
            0,
            "1-0",
            Bytes::from(vec![0u8; 64]),
        );
        assert!(matches!(
            Frame::decode_with_limit(frame.encode(), 16),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn final_chunk_suffix() {
        assert!(is_final_chunk_id("12_final"));
        assert!(!is_final_chunk_id("12"));
    }
}
