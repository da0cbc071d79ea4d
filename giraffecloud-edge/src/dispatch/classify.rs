//! Request classifier: picks the transport mode for a public request.
//!
//! The rules are a table evaluated first-match-wins; extending the
//! classifier means adding a row, not new control flow.

use axum::http::Method;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Unary,
    StreamingUpload,
    StreamingDownload,
}

/// The request facts the classifier looks at.
pub struct RequestProfile<'a> {
    pub method: &'a Method,
    /// Path without the query string.
    pub path: &'a str,
    pub content_length: Option<u64>,
}

/// Extensions whose responses are assumed large (media, archives, disk
/// images).
const LARGE_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "webm", "m4v", "mp3", "flac", "wav", "zip", "tar", "gz", "tgz",
    "7z", "rar", "iso", "img", "dmg",
];

/// Route prefixes that serve large objects.
const LARGE_PATH_PREFIXES: &[&str] = &[
    "/video/",
    "/videos/",
    "/download/",
    "/downloads/",
    "/original/",
];

/// Deterministic response-size estimates by extension, for paths the other
/// rules miss. Values are conservative upper guesses, not measurements.
const SIZE_HINTS: &[(&str, u64)] = &[
    ("sql", 32 * 1024 * 1024),
    ("bak", 64 * 1024 * 1024),
    ("log", 24 * 1024 * 1024),
    ("parquet", 128 * 1024 * 1024),
    ("db", 64 * 1024 * 1024),
];

type Rule = fn(&Classifier, &RequestProfile) -> Option<TransportMode>;

const RULES: &[(&str, Rule)] = &[
    ("upload-method", rule_upload_method),
    ("declared-length", rule_declared_length),
    ("large-extension", rule_large_extension),
    ("large-path-prefix", rule_large_path_prefix),
    ("estimated-size", rule_estimated_size),
];

#[derive(Clone)]
pub struct Classifier {
    pub threshold: u64,
    pub chunk_size: usize,
}

impl Classifier {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.large_file_threshold_bytes,
            chunk_size: config.chunk_size_bytes,
        }
    }

    pub fn classify(&self, profile: &RequestProfile) -> TransportMode {
        for (_name, rule) in RULES {
            if let Some(mode) = rule(self, profile) {
                return mode;
            }
        }
        TransportMode::Unary
    }
}

fn rule_upload_method(_c: &Classifier, p: &RequestProfile) -> Option<TransportMode> {
    match *p.method {
        Method::POST | Method::PUT | Method::PATCH => Some(TransportMode::StreamingUpload),
        _ => None,
    }
}

fn rule_declared_length(c: &Classifier, p: &RequestProfile) -> Option<TransportMode> {
    let length = p.content_length?;
    if length <= c.threshold {
        return None;
    }
    // Uploads were caught by the method rule; a large declared body on a
    // read method means a large response is expected.
    Some(TransportMode::StreamingDownload)
}

fn rule_large_extension(_c: &Classifier, p: &RequestProfile) -> Option<TransportMode> {
    let ext = path_extension(p.path)?;
    LARGE_EXTENSIONS
        .contains(&ext)
        .then_some(TransportMode::StreamingDownload)
}

fn rule_large_path_prefix(_c: &Classifier, p: &RequestProfile) -> Option<TransportMode> {
    LARGE_PATH_PREFIXES
        .iter()
        .any(|prefix| p.path.starts_with(prefix))
        .then_some(TransportMode::StreamingDownload)
}

fn rule_estimated_size(c: &Classifier, p: &RequestProfile) -> Option<TransportMode> {
    let ext = path_extension(p.path)?;
    let (_, estimate) = SIZE_HINTS.iter().find(|(hint, _)| *hint == ext)?;
    (*estimate > c.threshold).then_some(TransportMode::StreamingDownload)
}

fn path_extension(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next()?;
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier {
            threshold: 16 * 1024 * 1024,
            chunk_size: 4 * 1024 * 1024,
        }
    }

    fn profile<'a>(method: &'a Method, path: &'a str, content_length: Option<u64>) -> RequestProfile<'a> {
        RequestProfile {
            method,
            path,
            content_length,
        }
    }

    #[test]
    fn uploads_always_stream() {
        let c = classifier();
        for method in [Method::POST, Method::PUT, Method::PATCH] {
            assert_eq!(
                c.classify(&profile(&method, "/tiny", Some(3))),
                TransportMode::StreamingUpload
            );
        }
    }

    #[test]
    fn threshold_is_exclusive() {
        let c = classifier();
        let at = c.classify(&profile(&Method::GET, "/data", Some(16 * 1024 * 1024)));
        assert_eq!(at, TransportMode::Unary);
        let over = c.classify(&profile(&Method::GET, "/data", Some(16 * 1024 * 1024 + 1)));
        assert_eq!(over, TransportMode::StreamingDownload);
    }

    #[test]
    fn media_extension_streams_download() {
        let c = classifier();
        assert_eq!(
            c.classify(&profile(&Method::GET, "/video/movie.mp4", None)),
            TransportMode::StreamingDownload
        );
        assert_eq!(
            c.classify(&profile(&Method::GET, "/files/archive.tar", None)),
            TransportMode::StreamingDownload
        );
    }

    #[test]
    fn large_path_prefix_streams_download() {
        let c = classifier();
        assert_eq!(
            c.classify(&profile(&Method::GET, "/download/export", None)),
            TransportMode::StreamingDownload
        );
    }

    #[test]
    fn size_hint_above_threshold_streams() {
        let c = classifier();
        assert_eq!(
            c.classify(&profile(&Method::GET, "/dumps/all.parquet", None)),
            TransportMode::StreamingDownload
        );
    }

    #[test]
    fn plain_get_is_unary() {
        let c = classifier();
        assert_eq!(
            c.classify(&profile(&Method::GET, "/hi", Some(10))),
            TransportMode::Unary
        );
        assert_eq!(
            c.classify(&profile(&Method::GET, "/index.html", None)),
            TransportMode::Unary
        );
    }
}
