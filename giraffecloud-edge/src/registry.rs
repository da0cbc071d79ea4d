//! Tunnel registry: the process-wide map from domain to the single live
//! session serving it.
//!
//! Registered on agent connect, consulted on every public request, evicted on
//! disconnect. Readers never block each other; writers serialize per shard.

use std::sync::Arc;

use dashmap::DashMap;

use crate::session::TunnelSession;

/// Canonical domain form: lowercase, no port, no trailing dot.
pub fn normalize_domain(raw: &str) -> String {
    let host = raw.trim();
    let host = host.rsplit_once(':').map_or(host, |(name, port)| {
        // Only strip a real port suffix, not part of an IPv6 literal.
        if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() {
            name
        } else {
            host
        }
    });
    host.trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Default)]
pub struct TunnelRegistry {
    sessions: DashMap<String, Arc<TunnelSession>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically install `session` for its domain. Returns the evicted
    /// prior session, if any, so the caller can close it and wake its
    /// pending requests.
    pub fn register(&self, session: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        let domain = normalize_domain(&session.domain);
        self.sessions.insert(domain, session)
    }

    pub fn lookup(&self, domain: &str) -> Option<Arc<TunnelSession>> {
        self.sessions
            .get(&normalize_domain(domain))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `session` from the registry. Idempotent, and a no-op when a
    /// newer session already replaced it, so a late eviction cannot take out
    /// its successor.
    pub fn unregister(&self, session: &Arc<TunnelSession>) {
        let domain = normalize_domain(&session.domain);
        self.sessions
            .remove_if(&domain, |_, current| Arc::ptr_eq(current, session));
    }

    /// Current sessions, for observability and shutdown draining.
    pub fn snapshot(&self) -> Vec<Arc<TunnelSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::detached_session;

    #[test]
    fn normalization() {
        assert_eq!(normalize_domain("Example.COM"), "example.com");
        assert_eq!(normalize_domain("example.com."), "example.com");
        assert_eq!(normalize_domain("example.com:8443"), "example.com");
        assert_eq!(normalize_domain(" a.b "), "a.b");
    }

    #[tokio::test]
    async fn register_evicts_prior_session() {
        let registry = TunnelRegistry::new();
        let first = detached_session("a.example");
        let second = detached_session("A.example.");

        assert!(registry.register(Arc::clone(&first)).is_none());
        let evicted = registry.register(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&evicted, &first));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.lookup("a.example").unwrap(), &second));
    }

    #[tokio::test]
    async fn unregister_only_removes_identical_session() {
        let registry = TunnelRegistry::new();
        let old = detached_session("b.example");
        let new = detached_session("b.example");

        registry.register(Arc::clone(&old));
        registry.register(Arc::clone(&new));

        // A late cleanup from the evicted session must not remove the
        // replacement.
        registry.unregister(&old);
        assert!(registry.lookup("b.example").is_some());

        registry.unregister(&new);
        assert!(registry.lookup("b.example").is_none());
        registry.unregister(&new);
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let registry = TunnelRegistry::new();
        let session = detached_session("media.example.com");
        registry.register(session);
        assert!(registry.lookup("MEDIA.example.COM:443").is_some());
        assert!(registry.lookup("other.example.com").is_none());
    }
}
