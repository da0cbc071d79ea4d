//! Quota decisions consulted on the hot path.
//!
//! A decision is derived from the user's plan limit and the current billing
//! month's persisted usage, cached per user for a short TTL. When the
//! backing store is unreachable the decision fails open: traffic is never
//! dropped on metering faults.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::config::Config;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Warn,
    Block,
}

impl QuotaDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaStatus {
    pub used_bytes: u64,
    /// Monthly limit; non-positive means unlimited.
    pub limit_bytes: i64,
    pub decision: QuotaDecision,
}

struct CacheEntry {
    status: QuotaStatus,
    cached_at: Instant,
}

pub struct QuotaService {
    store: Arc<dyn Store>,
    cache: Mutex<HashMap<i64, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
    default_limit: i64,
    soft_pct: f64,
}

/// First day of the current billing month (UTC).
pub fn month_start() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.with_day(1).unwrap_or(today)
}

impl QuotaService {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(config.quota_cache_ttl_secs),
            capacity: config.quota_cache_capacity,
            default_limit: config.quota_default_monthly_bytes,
            soft_pct: config.quota_soft_warn_pct,
        }
    }

    pub async fn check(&self, user_id: i64) -> QuotaStatus {
        if let Some(hit) = self.cached(user_id) {
            return hit;
        }
        match self.compute(user_id).await {
            Ok(status) => {
                self.insert(user_id, status);
                status
            }
            Err(e) => {
                warn!(user_id, error = %e, "quota backend unavailable, failing open");
                QuotaStatus {
                    used_bytes: 0,
                    limit_bytes: self.default_limit,
                    decision: QuotaDecision::Allow,
                }
            }
        }
    }

    async fn compute(&self, user_id: i64) -> Result<QuotaStatus, StoreError> {
        let limit = self
            .store
            .plan_limit(user_id)
            .await?
            .unwrap_or(self.default_limit);
        let used = self.store.usage_since(user_id, month_start()).await?;
        let decision = if limit <= 0 {
            QuotaDecision::Allow
        } else if used >= limit as u64 {
            QuotaDecision::Block
        } else if (used as f64) >= self.soft_pct * limit as f64 {
            QuotaDecision::Warn
        } else {
            QuotaDecision::Allow
        };
        Ok(QuotaStatus {
            used_bytes: used,
            limit_bytes: limit,
            decision,
        })
    }

    fn cached(&self, user_id: i64) -> Option<QuotaStatus> {
        let cache = self.cache.lock();
        let entry = cache.get(&user_id)?;
        (entry.cached_at.elapsed() < self.ttl).then_some(entry.status)
    }

    fn insert(&self, user_id: i64, status: QuotaStatus) {
        let mut cache = self.cache.lock();
        if cache.len() >= self.capacity && !cache.contains_key(&user_id) {
            // Bounded cache: evict the stalest entry.
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, e)| e.cached_at)
                .map(|(id, _)| *id)
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            user_id,
            CacheEntry {
                status,
                cached_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreResult, UsageRecord};
    use clap::Parser;

    fn config() -> Config {
        Config::parse_from(["giraffecloud-edge"])
    }

    async fn seed_usage(store: &MemoryStore, user_id: i64, bytes: u64) {
        store
            .upsert_usage(&[UsageRecord {
                day: month_start(),
                user_id,
                tunnel_id: 1,
                domain: "a.example".into(),
                bytes_in: bytes,
                bytes_out: 0,
                requests: 1,
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn classifies_allow_warn_block() {
        let store = Arc::new(MemoryStore::new());
        store.set_plan_limit(1, 1000);
        store.set_plan_limit(2, 1000);
        store.set_plan_limit(3, 1000);
        seed_usage(&store, 1, 100).await;
        seed_usage(&store, 2, 950).await;
        seed_usage(&store, 3, 1000).await;

        let quota = QuotaService::new(store, &config());
        assert_eq!(quota.check(1).await.decision, QuotaDecision::Allow);
        assert_eq!(quota.check(2).await.decision, QuotaDecision::Warn);
        assert_eq!(quota.check(3).await.decision, QuotaDecision::Block);
    }

    #[tokio::test]
    async fn unlimited_plan_always_allows() {
        let store = Arc::new(MemoryStore::new());
        store.set_plan_limit(1, 0);
        seed_usage(&store, 1, u64::MAX / 2).await;
        let quota = QuotaService::new(store, &config());
        assert_eq!(quota.check(1).await.decision, QuotaDecision::Allow);
    }

    #[tokio::test]
    async fn decisions_are_cached_for_the_ttl() {
        let store = Arc::new(MemoryStore::new());
        store.set_plan_limit(1, 1000);
        let quota = QuotaService::new(Arc::clone(&store) as Arc<dyn Store>, &config());

        assert_eq!(quota.check(1).await.decision, QuotaDecision::Allow);
        // Usage jumps past the limit, but the cached decision holds.
        seed_usage(&store, 1, 5000).await;
        assert_eq!(quota.check(1).await.decision, QuotaDecision::Allow);
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl Store for FailingStore {
        async fn create_tunnel(
            &self,
            _new: crate::store::NewTunnel,
        ) -> StoreResult<crate::store::TunnelRecord> {
            Err(StoreError::Backend("down".into()))
        }
        async fn tunnel_by_id(&self, _id: i64) -> StoreResult<Option<crate::store::TunnelRecord>> {
            Err(StoreError::Backend("down".into()))
        }
        async fn tunnel_by_domain(
            &self,
            _domain: &str,
        ) -> StoreResult<Option<crate::store::TunnelRecord>> {
            Err(StoreError::Backend("down".into()))
        }
        async fn tunnel_by_token(
            &self,
            _token: &str,
        ) -> StoreResult<Option<crate::store::TunnelRecord>> {
            Err(StoreError::Backend("down".into()))
        }
        async fn tunnels_for_user(
            &self,
            _user_id: i64,
        ) -> StoreResult<Vec<crate::store::TunnelRecord>> {
            Err(StoreError::Backend("down".into()))
        }
        async fn update_tunnel(
            &self,
            _id: i64,
            _patch: crate::store::TunnelPatch,
        ) -> StoreResult<Option<crate::store::TunnelRecord>> {
            Err(StoreError::Backend("down".into()))
        }
        async fn delete_tunnel(&self, _id: i64) -> StoreResult<bool> {
            Err(StoreError::Backend("down".into()))
        }
        async fn set_client_ip(&self, _id: i64, _ip: Option<&str>) -> StoreResult<()> {
            Err(StoreError::Backend("down".into()))
        }
        async fn upsert_usage(&self, _records: &[UsageRecord]) -> StoreResult<()> {
            Err(StoreError::Backend("down".into()))
        }
        async fn usage_on_day(
            &self,
            _user_id: i64,
            _day: NaiveDate,
        ) -> StoreResult<crate::store::UsageTotals> {
            Err(StoreError::Backend("down".into()))
        }
        async fn usage_since(&self, _user_id: i64, _from: NaiveDate) -> StoreResult<u64> {
            Err(StoreError::Backend("down".into()))
        }
        async fn plan_limit(&self, _user_id: i64) -> StoreResult<Option<i64>> {
            Err(StoreError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn backend_failure_fails_open() {
        let quota = QuotaService::new(Arc::new(FailingStore), &config());
        assert_eq!(quota.check(1).await.decision, QuotaDecision::Allow);
    }
}
