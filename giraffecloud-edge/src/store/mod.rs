//! Persistence boundary: the only schema the engine touches is tunnels,
//! usage, and plans. Everything else about accounts lives in the external
//! control plane.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub id: i64,
    pub user_id: i64,
    /// Unique, immutable after create.
    pub domain: String,
    /// Opaque agent credential, 32 random bytes hex-encoded.
    pub token: String,
    pub target_port: u16,
    pub is_enabled: bool,
    /// Last observed agent IP; `None` while no agent is connected.
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub user_id: i64,
    pub domain: String,
    pub token: String,
    pub target_port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct TunnelPatch {
    pub is_enabled: Option<bool>,
    pub target_port: Option<u16>,
}

/// One flushed usage row, keyed by (UTC day, user, tunnel, domain).
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub day: NaiveDate,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub domain: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Insert a tunnel; `Conflict` when the domain is already taken.
    async fn create_tunnel(&self, new: NewTunnel) -> StoreResult<TunnelRecord>;
    async fn tunnel_by_id(&self, id: i64) -> StoreResult<Option<TunnelRecord>>;
    async fn tunnel_by_domain(&self, domain: &str) -> StoreResult<Option<TunnelRecord>>;
    async fn tunnel_by_token(&self, token: &str) -> StoreResult<Option<TunnelRecord>>;
    async fn tunnels_for_user(&self, user_id: i64) -> StoreResult<Vec<TunnelRecord>>;
    /// Apply a patch; the domain is not updatable.
    async fn update_tunnel(&self, id: i64, patch: TunnelPatch) -> StoreResult<Option<TunnelRecord>>;
    /// Returns whether a row was deleted; deleting twice is fine.
    async fn delete_tunnel(&self, id: i64) -> StoreResult<bool>;
    async fn set_client_ip(&self, id: i64, ip: Option<&str>) -> StoreResult<()>;

    /// Add the given counters onto their rows, all inside one transaction.
    async fn upsert_usage(&self, records: &[UsageRecord]) -> StoreResult<()>;
    async fn usage_on_day(&self, user_id: i64, day: NaiveDate) -> StoreResult<UsageTotals>;
    /// Total bytes (in + out) for a user from `from` onward.
    async fn usage_since(&self, user_id: i64, from: NaiveDate) -> StoreResult<u64>;

    /// Monthly byte limit from the user's plan, if any is assigned.
    async fn plan_limit(&self, user_id: i64) -> StoreResult<Option<i64>>;
}
