//! SQLite-backed store (embedded, bundled).
//!
//! Calls go through a single connection behind an async mutex; the only
//! multi-statement operation is the usage flush, which runs in one
//! transaction.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::{
    NewTunnel, Store, StoreError, StoreResult, TunnelPatch, TunnelRecord, UsageRecord, UsageTotals,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tunnels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    domain TEXT NOT NULL UNIQUE,
    token TEXT NOT NULL,
    target_port INTEGER NOT NULL,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    client_ip TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tunnels_token ON tunnels(token);
CREATE INDEX IF NOT EXISTS idx_tunnels_user ON tunnels(user_id);

CREATE TABLE IF NOT EXISTS usage (
    period_start TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    tunnel_id INTEGER NOT NULL,
    domain TEXT NOT NULL,
    bytes_in INTEGER NOT NULL DEFAULT 0,
    bytes_out INTEGER NOT NULL DEFAULT 0,
    requests INTEGER NOT NULL DEFAULT 0,
    UNIQUE(period_start, user_id, tunnel_id, domain)
);
CREATE INDEX IF NOT EXISTS idx_usage_user_period ON usage(user_id, period_start);

CREATE TABLE IF NOT EXISTS plans (
    name TEXT PRIMARY KEY,
    monthly_limit_bytes INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS user_plans (
    user_id INTEGER PRIMARY KEY,
    plan_name TEXT NOT NULL REFERENCES plans(name)
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn db_err(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn map_tunnel(row: &Row<'_>) -> rusqlite::Result<TunnelRecord> {
    Ok(TunnelRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        domain: row.get(2)?,
        token: row.get(3)?,
        target_port: row.get::<_, i64>(4)? as u16,
        is_enabled: row.get::<_, i64>(5)? != 0,
        client_ip: row.get(6)?,
        created_at: parse_timestamp(row.get(7)?),
        updated_at: parse_timestamp(row.get(8)?),
    })
}

const TUNNEL_COLUMNS: &str =
    "id, user_id, domain, token, target_port, is_enabled, client_ip, created_at, updated_at";

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn create_tunnel(&self, new: NewTunnel) -> StoreResult<TunnelRecord> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let result = conn.execute(
            "INSERT INTO tunnels (user_id, domain, token, target_port, is_enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
            params![new.user_id, new.domain, new.token, new.target_port as i64, now],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Conflict(format!(
                    "domain {} is already taken",
                    new.domain
                )));
            }
            Err(e) => return Err(db_err(e)),
        }
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE id = ?1"),
            params![id],
            map_tunnel,
        )
        .map_err(db_err)
    }

    async fn tunnel_by_id(&self, id: i64) -> StoreResult<Option<TunnelRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE id = ?1"),
            params![id],
            map_tunnel,
        )
        .optional()
        .map_err(db_err)
    }

    async fn tunnel_by_domain(&self, domain: &str) -> StoreResult<Option<TunnelRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE domain = ?1 COLLATE NOCASE"),
            params![domain],
            map_tunnel,
        )
        .optional()
        .map_err(db_err)
    }

    async fn tunnel_by_token(&self, token: &str) -> StoreResult<Option<TunnelRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE token = ?1"),
            params![token],
            map_tunnel,
        )
        .optional()
        .map_err(db_err)
    }

    async fn tunnels_for_user(&self, user_id: i64) -> StoreResult<Vec<TunnelRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE user_id = ?1 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user_id], map_tunnel)
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    async fn update_tunnel(&self, id: i64, patch: TunnelPatch) -> StoreResult<Option<TunnelRecord>> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        if let Some(enabled) = patch.is_enabled {
            conn.execute(
                "UPDATE tunnels SET is_enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, enabled as i64, now],
            )
            .map_err(db_err)?;
        }
        if let Some(port) = patch.target_port {
            conn.execute(
                "UPDATE tunnels SET target_port = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, port as i64, now],
            )
            .map_err(db_err)?;
        }
        conn.query_row(
            &format!("SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE id = ?1"),
            params![id],
            map_tunnel,
        )
        .optional()
        .map_err(db_err)
    }

    async fn delete_tunnel(&self, id: i64) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute("DELETE FROM tunnels WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn set_client_ip(&self, id: i64, ip: Option<&str>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tunnels SET client_ip = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, ip, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_usage(&self, records: &[UsageRecord]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO usage (period_start, user_id, tunnel_id, domain, bytes_in, bytes_out, requests)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(period_start, user_id, tunnel_id, domain) DO UPDATE SET
                         bytes_in = bytes_in + excluded.bytes_in,
                         bytes_out = bytes_out + excluded.bytes_out,
                         requests = requests + excluded.requests",
                )
                .map_err(db_err)?;
            for rec in records {
                stmt.execute(params![
                    rec.day.to_string(),
                    rec.user_id,
                    rec.tunnel_id,
                    rec.domain,
                    rec.bytes_in as i64,
                    rec.bytes_out as i64,
                    rec.requests as i64,
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    async fn usage_on_day(&self, user_id: i64, day: NaiveDate) -> StoreResult<UsageTotals> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COALESCE(SUM(bytes_in), 0), COALESCE(SUM(bytes_out), 0), COALESCE(SUM(requests), 0)
             FROM usage WHERE user_id = ?1 AND period_start = ?2",
            params![user_id, day.to_string()],
            |row| {
                Ok(UsageTotals {
                    bytes_in: row.get::<_, i64>(0)? as u64,
                    bytes_out: row.get::<_, i64>(1)? as u64,
                    requests: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .map_err(db_err)
    }

    async fn usage_since(&self, user_id: i64, from: NaiveDate) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COALESCE(SUM(bytes_in + bytes_out), 0)
             FROM usage WHERE user_id = ?1 AND period_start >= ?2",
            params![user_id, from.to_string()],
            |row| row.get::<_, i64>(0).map(|v| v as u64),
        )
        .map_err(db_err)
    }

    async fn plan_limit(&self, user_id: i64) -> StoreResult<Option<i64>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT p.monthly_limit_bytes FROM user_plans up
             JOIN plans p ON p.name = up.plan_name
             WHERE up.user_id = ?1 AND p.active = 1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tunnel(domain: &str) -> NewTunnel {
        NewTunnel {
            user_id: 1,
            domain: domain.into(),
            token: format!("token-{domain}"),
            target_port: 8000,
        }
    }

    #[tokio::test]
    async fn create_conflict_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.create_tunnel(new_tunnel("a.example")).await.unwrap();
        assert_eq!(created.domain, "a.example");
        assert!(created.is_enabled);

        let err = store.create_tunnel(new_tunnel("a.example")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        assert!(store.delete_tunnel(created.id).await.unwrap());
        assert!(store.tunnel_by_id(created.id).await.unwrap().is_none());
        assert!(!store.delete_tunnel(created.id).await.unwrap());
    }

    #[tokio::test]
    async fn patch_updates_flag_and_port() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.create_tunnel(new_tunnel("b.example")).await.unwrap();
        let updated = store
            .update_tunnel(
                created.id,
                TunnelPatch {
                    is_enabled: Some(false),
                    target_port: Some(9000),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(!updated.is_enabled);
        assert_eq!(updated.target_port, 9000);
    }

    #[tokio::test]
    async fn usage_upsert_accumulates_in_one_transaction() {
        let store = SqliteStore::open_in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let rec = UsageRecord {
            day,
            user_id: 4,
            tunnel_id: 9,
            domain: "c.example".into(),
            bytes_in: 100,
            bytes_out: 50,
            requests: 2,
        };
        store.upsert_usage(&[rec.clone(), rec]).await.unwrap();

        let totals = store.usage_on_day(4, day).await.unwrap();
        assert_eq!(totals.bytes_in, 200);
        assert_eq!(totals.bytes_out, 100);
        assert_eq!(totals.requests, 4);
        assert_eq!(store.usage_since(4, day).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn plan_limit_joins_active_plans() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock().await;
            conn.execute_batch(
                "INSERT INTO plans (name, monthly_limit_bytes, active) VALUES ('pro', 1000, 1);
                 INSERT INTO plans (name, monthly_limit_bytes, active) VALUES ('old', 5, 0);
                 INSERT INTO user_plans (user_id, plan_name) VALUES (1, 'pro');
                 INSERT INTO user_plans (user_id, plan_name) VALUES (2, 'old');",
            )
            .unwrap();
        }
        assert_eq!(store.plan_limit(1).await.unwrap(), Some(1000));
        assert_eq!(store.plan_limit(2).await.unwrap(), None);
        assert_eq!(store.plan_limit(3).await.unwrap(), None);
    }
}
