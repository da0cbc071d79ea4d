//! JSON metadata blocks embedded in composite envelopes.

use serde::{Deserialize, Serialize};

use crate::frame::is_final_chunk_id;

/// Metadata for `HttpRequest`, `HttpRequestStart` and `LargeFileRequest`
/// envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    pub method: String,
    /// Path plus query string, as received on the public side.
    pub path: String,
    /// Header list preserving duplicates (e.g. multiple Cookie).
    pub headers: Vec<(String, String)>,
    /// Observed public client IP, forwarded for origin logging.
    pub client_ip: String,
    /// Set on `HttpRequestStart`/`LargeFileRequest` when the edge expects a
    /// large transfer.
    #[serde(default)]
    pub large_file: bool,
    /// Chunk-size suggestion for `LargeFileRequest` (0 means agent default).
    #[serde(default)]
    pub chunk_size: u64,
}

/// Metadata for `HttpResponse` envelopes.
///
/// The first envelope of a response carries status and headers. Chunked
/// continuation envelopes carry only `is_chunked`/`chunk_id`; the terminal
/// chunk has `chunk_id` suffixed with `_final` and the `END_STREAM` flag set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub is_chunked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
}

impl ResponseMeta {
    pub fn is_final(&self) -> bool {
        self.chunk_id.as_deref().is_some_and(is_final_chunk_id)
    }
}

/// Negotiated parameters returned by the edge after a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMeta {
    pub chunk_size: u64,
    pub large_file_threshold: u64,
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_meta_omits_empty_fields() {
        let meta = ResponseMeta {
            status: 0,
            status_text: String::new(),
            headers: Vec::new(),
            is_chunked: true,
            chunk_id: Some("3".into()),
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("headers"));
        let parsed: ResponseMeta = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_chunked);
        assert!(!parsed.is_final());
    }

    #[test]
    fn final_chunk_detection() {
        let meta = ResponseMeta {
            status: 0,
            status_text: String::new(),
            headers: Vec::new(),
            is_chunked: true,
            chunk_id: Some("7_final".into()),
        };
        assert!(meta.is_final());
    }

    #[test]
    fn request_meta_defaults() {
        let json = r#"{"method":"GET","path":"/hi","headers":[],"client_ip":"1.2.3.4"}"#;
        let meta: RequestMeta = serde_json::from_str(json).unwrap();
        assert!(!meta.large_file);
        assert_eq!(meta.chunk_size, 0);
    }
}
