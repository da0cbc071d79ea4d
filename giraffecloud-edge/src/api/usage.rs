//! Usage summary endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::api::auth::require_user;
use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TodayUsage {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests: u64,
}

#[derive(Debug, Serialize)]
pub struct MonthUsage {
    pub used_bytes: u64,
    pub limit_bytes: i64,
    pub decision: &'static str,
}

#[derive(Debug, Serialize)]
pub struct UsageSummary {
    pub today: TodayUsage,
    pub month: MonthUsage,
}

/// `GET /usage/summary` — today's counters (flushed plus in-memory) and the
/// current month's quota standing.
pub async fn usage_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UsageSummary>> {
    let user_id = require_user(&state, &headers).await?;

    let persisted = state
        .store
        .usage_on_day(user_id, Utc::now().date_naive())
        .await?;
    let pending = state.usage.pending_today(user_id);
    let quota = state.quota.check(user_id).await;

    Ok(Json(UsageSummary {
        today: TodayUsage {
            bytes_in: persisted.bytes_in + pending.bytes_in,
            bytes_out: persisted.bytes_out + pending.bytes_out,
            requests: persisted.requests + pending.requests,
        },
        month: MonthUsage {
            used_bytes: quota.used_bytes,
            limit_bytes: quota.limit_bytes,
            decision: quota.decision.as_str(),
        },
    }))
}
