//! Control-plane router: tunnel CRUD, usage summary, the front-door
//! ask-endpoint, and the agent stream endpoint.

pub mod auth;
pub mod tunnels;
pub mod usage;

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::registry::normalize_domain;
use crate::session::handler::agent_stream_handler;
use crate::state::AppState;

pub fn control_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/check-domain", get(check_domain))
        .route("/tunnel/stream", get(agent_stream_handler))
        .route(
            "/tunnels",
            get(tunnels::list_tunnels).post(tunnels::create_tunnel),
        )
        .route("/tunnels/free", get(tunnels::free_domain))
        .route(
            "/tunnels/{id}",
            get(tunnels::get_tunnel)
                .patch(tunnels::update_tunnel)
                .delete(tunnels::delete_tunnel),
        )
        .route("/usage/summary", get(usage::usage_summary))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct CheckDomainQuery {
    #[serde(default)]
    domain: String,
}

/// `GET /check-domain?domain=…` — front-door authorization probe. 200 only
/// when an enabled tunnel exists for the name; anything else means "do not
/// issue a certificate".
async fn check_domain(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckDomainQuery>,
) -> StatusCode {
    if query.domain.is_empty() {
        return StatusCode::NOT_FOUND;
    }
    let domain = normalize_domain(&query.domain);
    match state.store.tunnel_by_domain(&domain).await {
        Ok(Some(tunnel)) if tunnel.is_enabled => StatusCode::OK,
        Ok(_) => StatusCode::NOT_FOUND,
        Err(e) => {
            debug!(domain = %domain, error = %e, "check-domain store lookup failed");
            StatusCode::NOT_FOUND
        }
    }
}
