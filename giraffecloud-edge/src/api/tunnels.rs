//! Control-plane REST for tunnels.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::auth::require_user;
use crate::audit::AuditEvent;
use crate::error::{Error, Result};
use crate::registry::normalize_domain;
use crate::state::AppState;
use crate::store::{NewTunnel, TunnelPatch, TunnelRecord};
use crate::subdomain;

#[derive(Debug, Serialize)]
pub struct TunnelDto {
    pub id: i64,
    pub domain: String,
    /// Only present on create; reads never echo the credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub target_port: u16,
    #[serde(rename = "is_active")]
    pub is_enabled: bool,
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TunnelDto {
    fn from_record(record: TunnelRecord, include_token: bool) -> Self {
        Self {
            id: record.id,
            domain: record.domain,
            token: include_token.then_some(record.token),
            target_port: record.target_port,
            is_enabled: record.is_enabled,
            client_ip: record.client_ip,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    pub domain: Option<String>,
    pub target_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTunnelRequest {
    pub is_active: Option<bool>,
    pub target_port: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct FreeDomainResponse {
    pub domain: String,
    pub available: bool,
}

/// Fresh agent credential: 32 random bytes, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.len() > 253 {
        return Err(Error::Validation("domain length must be 1..=253".into()));
    }
    if !domain.contains('.') {
        return Err(Error::Validation(
            "domain must contain at least one dot".into(),
        ));
    }
    for label in domain.split('.') {
        let valid = !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(Error::Validation(format!(
                "domain label {label:?} is invalid"
            )));
        }
    }
    Ok(())
}

/// `POST /tunnels`
pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateTunnelRequest>,
) -> Result<impl IntoResponse> {
    let user_id = require_user(&state, &headers).await?;
    if payload.target_port == 0 {
        return Err(Error::Validation("target_port must be positive".into()));
    }

    let domain = match payload.domain {
        Some(raw) => {
            let domain = normalize_domain(&raw);
            validate_domain(&domain)?;
            domain
        }
        None => subdomain::generated_domain(
            &state.config.subdomain_secret,
            user_id,
            &state.config.base_domain(),
        ),
    };

    let record = state
        .store
        .create_tunnel(NewTunnel {
            user_id,
            domain,
            token: generate_token(),
            target_port: payload.target_port,
        })
        .await?;

    info!(user_id, tunnel_id = record.id, domain = %record.domain, "tunnel created");
    state.audit.record(AuditEvent::new(
        "tunnel.created",
        user_id,
        record.id,
        &record.domain,
    ));
    Ok((
        StatusCode::CREATED,
        Json(TunnelDto::from_record(record, true)),
    ))
}

/// `GET /tunnels`
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<TunnelDto>>> {
    let user_id = require_user(&state, &headers).await?;
    let records = state.store.tunnels_for_user(user_id).await?;
    Ok(Json(
        records
            .into_iter()
            .map(|r| TunnelDto::from_record(r, false))
            .collect(),
    ))
}

/// `GET /tunnels/{id}`
pub async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<TunnelDto>> {
    let user_id = require_user(&state, &headers).await?;
    let record = owned_tunnel(&state, user_id, id).await?;
    Ok(Json(TunnelDto::from_record(record, false)))
}

/// `PATCH /tunnels/{id}` — the domain is not updatable.
pub async fn update_tunnel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateTunnelRequest>,
) -> Result<Json<TunnelDto>> {
    let user_id = require_user(&state, &headers).await?;
    let record = owned_tunnel(&state, user_id, id).await?;
    if payload.target_port == Some(0) {
        return Err(Error::Validation("target_port must be positive".into()));
    }

    let updated = state
        .store
        .update_tunnel(
            id,
            TunnelPatch {
                is_enabled: payload.is_active,
                target_port: payload.target_port,
            },
        )
        .await?
        .ok_or_else(|| Error::NotFound(format!("tunnel {id} does not exist")))?;

    // Disabling takes effect immediately: the live session, if any, is
    // evicted so dispatch stops accepting traffic for the domain.
    if payload.is_active == Some(false) {
        if let Some(session) = state.registry.lookup(&record.domain) {
            session.trigger_close();
        }
        state.audit.record(AuditEvent::new(
            "tunnel.disabled",
            user_id,
            id,
            &record.domain,
        ));
    }
    Ok(Json(TunnelDto::from_record(updated, false)))
}

/// `DELETE /tunnels/{id}` — removes any live session; deleting twice is a
/// no-op.
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    let user_id = require_user(&state, &headers).await?;
    let record = match state.store.tunnel_by_id(id).await? {
        Some(record) if record.user_id == user_id => record,
        Some(_) => return Err(Error::Forbidden(format!("tunnel {id} belongs to another user"))),
        None => return Ok(StatusCode::NO_CONTENT),
    };

    state.store.delete_tunnel(id).await?;
    if let Some(session) = state.registry.lookup(&record.domain) {
        session.trigger_close();
    }
    info!(user_id, tunnel_id = id, domain = %record.domain, "tunnel deleted");
    state.audit.record(AuditEvent::new(
        "tunnel.deleted",
        user_id,
        id,
        &record.domain,
    ));
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /tunnels/free` — the caller's generated subdomain and whether it is
/// still unclaimed.
pub async fn free_domain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<FreeDomainResponse>> {
    let user_id = require_user(&state, &headers).await?;
    let domain = subdomain::generated_domain(
        &state.config.subdomain_secret,
        user_id,
        &state.config.base_domain(),
    );
    let available = state.store.tunnel_by_domain(&domain).await?.is_none();
    Ok(Json(FreeDomainResponse { domain, available }))
}

async fn owned_tunnel(state: &Arc<AppState>, user_id: i64, id: i64) -> Result<TunnelRecord> {
    let record = state
        .store
        .tunnel_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("tunnel {id} does not exist")))?;
    if record.user_id != user_id {
        return Err(Error::Forbidden(format!(
            "tunnel {id} belongs to another user"
        )));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_long_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn domain_validation() {
        assert!(validate_domain("a.example").is_ok());
        assert!(validate_domain("sub-1.media.example.com").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("nodot").is_err());
        assert!(validate_domain("-bad.example").is_err());
        assert!(validate_domain("bad-.example").is_err());
        assert!(validate_domain("sp ace.example").is_err());
        assert!(validate_domain("upper.Example").is_err());
    }
}
