//! On-path usage metering.
//!
//! Increments land in a process-wide map under a brief lock; a background
//! flusher snapshots and clears the map every flush interval (or sooner past
//! the high-watermark) and upserts the snapshot into persistence in one
//! transaction. Backend failures never touch the request path: the snapshot
//! is merged back and flushed again later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::store::{Store, UsageRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UsageKey {
    day: NaiveDate,
    user_id: i64,
    tunnel_id: i64,
    domain: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsageCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests: u64,
}

pub struct UsageTracker {
    live: Mutex<HashMap<UsageKey, UsageCounters>>,
    store: Arc<dyn Store>,
    watermark: usize,
    flush_now: Notify,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn Store>, watermark: usize) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            store,
            watermark,
            flush_now: Notify::new(),
        }
    }

    /// Record one completed request. Attributed to exactly one
    /// (user, tunnel, domain) under today's UTC day.
    pub fn increment(
        &self,
        user_id: i64,
        tunnel_id: i64,
        domain: &str,
        bytes_in: u64,
        bytes_out: u64,
        requests: u64,
    ) {
        let key = UsageKey {
            day: Utc::now().date_naive(),
            user_id,
            tunnel_id,
            domain: domain.to_string(),
        };
        let over_watermark = {
            let mut live = self.live.lock();
            let entry = live.entry(key).or_default();
            entry.bytes_in += bytes_in;
            entry.bytes_out += bytes_out;
            entry.requests += requests;
            live.len() > self.watermark
        };
        if over_watermark {
            self.flush_now.notify_one();
        }
    }

    /// Today's not-yet-flushed counters for a user.
    pub fn pending_today(&self, user_id: i64) -> UsageCounters {
        let today = Utc::now().date_naive();
        let live = self.live.lock();
        let mut out = UsageCounters::default();
        for (key, counters) in live.iter() {
            if key.user_id == user_id && key.day == today {
                out.bytes_in += counters.bytes_in;
                out.bytes_out += counters.bytes_out;
                out.requests += counters.requests;
            }
        }
        out
    }

    /// Snapshot, clear, and persist. On backend failure the snapshot merges
    /// back into the live map so nothing is lost.
    pub async fn flush(&self) {
        let snapshot: Vec<UsageRecord> = {
            let mut live = self.live.lock();
            if live.is_empty() {
                return;
            }
            live.drain()
                .map(|(key, counters)| UsageRecord {
                    day: key.day,
                    user_id: key.user_id,
                    tunnel_id: key.tunnel_id,
                    domain: key.domain,
                    bytes_in: counters.bytes_in,
                    bytes_out: counters.bytes_out,
                    requests: counters.requests,
                })
                .collect()
        };
        match self.store.upsert_usage(&snapshot).await {
            Ok(()) => debug!(records = snapshot.len(), "usage flushed"),
            Err(e) => {
                error!(error = %e, records = snapshot.len(), "usage flush failed, keeping records in memory");
                let mut live = self.live.lock();
                for rec in snapshot {
                    let entry = live
                        .entry(UsageKey {
                            day: rec.day,
                            user_id: rec.user_id,
                            tunnel_id: rec.tunnel_id,
                            domain: rec.domain,
                        })
                        .or_default();
                    entry.bytes_in += rec.bytes_in;
                    entry.bytes_out += rec.bytes_out;
                    entry.requests += rec.requests;
                }
            }
        }
    }

    /// Periodic flusher with a mandatory final flush on shutdown.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => tracker.flush().await,
                    _ = tracker.flush_now.notified() => tracker.flush().await,
                    _ = shutdown.changed() => {
                        tracker.flush().await;
                        info!("final usage flush complete");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn increments_aggregate_per_tuple() {
        let store = Arc::new(MemoryStore::new());
        let tracker = UsageTracker::new(store, 1000);
        tracker.increment(1, 2, "a.example", 10, 5, 1);
        tracker.increment(1, 2, "a.example", 10, 5, 1);
        tracker.increment(1, 3, "b.example", 7, 0, 1);

        let totals = tracker.pending_today(1);
        assert_eq!(totals.bytes_in, 27);
        assert_eq!(totals.bytes_out, 10);
        assert_eq!(totals.requests, 3);
        assert_eq!(tracker.pending_today(2), UsageCounters::default());
    }

    #[tokio::test]
    async fn flush_persists_and_clears() {
        let store = Arc::new(MemoryStore::new());
        let tracker = UsageTracker::new(Arc::clone(&store) as Arc<dyn Store>, 1000);
        tracker.increment(1, 2, "a.example", 10, 5, 1);

        tracker.flush().await;
        assert_eq!(tracker.pending_today(1), UsageCounters::default());

        use crate::store::Store as _;
        let persisted = store
            .usage_on_day(1, Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(persisted.bytes_in, 10);
        assert_eq!(persisted.bytes_out, 5);
        assert_eq!(persisted.requests, 1);

        // A second flush with nothing pending is a no-op.
        tracker.flush().await;
        let persisted = store
            .usage_on_day(1, Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(persisted.requests, 1);
    }
}
