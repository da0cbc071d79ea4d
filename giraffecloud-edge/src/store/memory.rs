//! In-memory store for development and tests.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use subtle::ConstantTimeEq;

use super::{
    NewTunnel, Store, StoreError, StoreResult, TunnelPatch, TunnelRecord, UsageRecord, UsageTotals,
};

#[derive(Default)]
struct Inner {
    tunnels: HashMap<i64, TunnelRecord>,
    next_id: i64,
    usage: HashMap<(NaiveDate, i64, i64, String), UsageTotals>,
    plans: HashMap<i64, i64>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stand-in for the external plan assignment flow.
    #[cfg(test)]
    pub fn set_plan_limit(&self, user_id: i64, monthly_limit_bytes: i64) {
        self.inner.lock().plans.insert(user_id, monthly_limit_bytes);
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn create_tunnel(&self, new: NewTunnel) -> StoreResult<TunnelRecord> {
        let mut inner = self.inner.lock();
        if inner
            .tunnels
            .values()
            .any(|t| t.domain.eq_ignore_ascii_case(&new.domain))
        {
            return Err(StoreError::Conflict(format!(
                "domain {} is already taken",
                new.domain
            )));
        }
        inner.next_id += 1;
        let now = Utc::now();
        let record = TunnelRecord {
            id: inner.next_id,
            user_id: new.user_id,
            domain: new.domain,
            token: new.token,
            target_port: new.target_port,
            is_enabled: true,
            client_ip: None,
            created_at: now,
            updated_at: now,
        };
        inner.tunnels.insert(record.id, record.clone());
        Ok(record)
    }

    async fn tunnel_by_id(&self, id: i64) -> StoreResult<Option<TunnelRecord>> {
        Ok(self.inner.lock().tunnels.get(&id).cloned())
    }

    async fn tunnel_by_domain(&self, domain: &str) -> StoreResult<Option<TunnelRecord>> {
        Ok(self
            .inner
            .lock()
            .tunnels
            .values()
            .find(|t| t.domain.eq_ignore_ascii_case(domain))
            .cloned())
    }

    async fn tunnel_by_token(&self, token: &str) -> StoreResult<Option<TunnelRecord>> {
        let inner = self.inner.lock();
        // Constant-time scan; a mismatching candidate must cost the same as
        // a matching one.
        let mut found: Option<&TunnelRecord> = None;
        for record in inner.tunnels.values() {
            let token_bytes = token.as_bytes();
            let candidate = record.token.as_bytes();
            if token_bytes.len() == candidate.len()
                && token_bytes.ct_eq(candidate).unwrap_u8() == 1
            {
                found = Some(record);
            }
        }
        Ok(found.cloned())
    }

    async fn tunnels_for_user(&self, user_id: i64) -> StoreResult<Vec<TunnelRecord>> {
        let mut list: Vec<TunnelRecord> = self
            .inner
            .lock()
            .tunnels
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|t| t.id);
        Ok(list)
    }

    async fn update_tunnel(&self, id: i64, patch: TunnelPatch) -> StoreResult<Option<TunnelRecord>> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.tunnels.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(enabled) = patch.is_enabled {
            record.is_enabled = enabled;
        }
        if let Some(port) = patch.target_port {
            record.target_port = port;
        }
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn delete_tunnel(&self, id: i64) -> StoreResult<bool> {
        Ok(self.inner.lock().tunnels.remove(&id).is_some())
    }

    async fn set_client_ip(&self, id: i64, ip: Option<&str>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.tunnels.get_mut(&id) {
            record.client_ip = ip.map(str::to_string);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn upsert_usage(&self, records: &[UsageRecord]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        for rec in records {
            let key = (rec.day, rec.user_id, rec.tunnel_id, rec.domain.clone());
            let totals = inner.usage.entry(key).or_default();
            totals.bytes_in += rec.bytes_in;
            totals.bytes_out += rec.bytes_out;
            totals.requests += rec.requests;
        }
        Ok(())
    }

    async fn usage_on_day(&self, user_id: i64, day: NaiveDate) -> StoreResult<UsageTotals> {
        let inner = self.inner.lock();
        let mut out = UsageTotals::default();
        for ((d, u, _, _), totals) in inner.usage.iter() {
            if *d == day && *u == user_id {
                out.bytes_in += totals.bytes_in;
                out.bytes_out += totals.bytes_out;
                out.requests += totals.requests;
            }
        }
        Ok(out)
    }

    async fn usage_since(&self, user_id: i64, from: NaiveDate) -> StoreResult<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .usage
            .iter()
            .filter(|((d, u, _, _), _)| *u == user_id && *d >= from)
            .map(|(_, t)| t.bytes_in + t.bytes_out)
            .sum())
    }

    async fn plan_limit(&self, user_id: i64) -> StoreResult<Option<i64>> {
        Ok(self.inner.lock().plans.get(&user_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tunnel(user_id: i64, domain: &str) -> NewTunnel {
        NewTunnel {
            user_id,
            domain: domain.into(),
            token: format!("token-for-{domain}"),
            target_port: 8000,
        }
    }

    #[tokio::test]
    async fn create_then_fetch_roundtrips_domain() {
        let store = MemoryStore::new();
        let created = store.create_tunnel(new_tunnel(1, "a.example")).await.unwrap();
        let fetched = store.tunnel_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.domain, "a.example");
        assert!(fetched.is_enabled);
    }

    #[tokio::test]
    async fn duplicate_domain_conflicts() {
        let store = MemoryStore::new();
        store.create_tunnel(new_tunnel(1, "a.example")).await.unwrap();
        let err = store
            .create_tunnel(new_tunnel(2, "A.EXAMPLE"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        let created = store.create_tunnel(new_tunnel(1, "a.example")).await.unwrap();
        assert!(store.delete_tunnel(created.id).await.unwrap());
        assert!(store.tunnel_by_id(created.id).await.unwrap().is_none());
        assert!(!store.delete_tunnel(created.id).await.unwrap());
    }

    #[tokio::test]
    async fn token_lookup_finds_exact_match_only() {
        let store = MemoryStore::new();
        let created = store.create_tunnel(new_tunnel(1, "a.example")).await.unwrap();
        assert!(store
            .tunnel_by_token(&created.token)
            .await
            .unwrap()
            .is_some());
        assert!(store.tunnel_by_token("other-token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_upserts_accumulate() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let rec = UsageRecord {
            day,
            user_id: 1,
            tunnel_id: 2,
            domain: "a.example".into(),
            bytes_in: 10,
            bytes_out: 5,
            requests: 1,
        };
        store.upsert_usage(&[rec.clone()]).await.unwrap();
        store.upsert_usage(&[rec]).await.unwrap();

        let totals = store.usage_on_day(1, day).await.unwrap();
        assert_eq!(totals.bytes_in, 20);
        assert_eq!(totals.bytes_out, 10);
        assert_eq!(totals.requests, 2);
        assert_eq!(store.usage_since(1, day).await.unwrap(), 30);
        assert_eq!(
            store
                .usage_since(1, day.succ_opt().unwrap())
                .await
                .unwrap(),
            0
        );
    }
}
