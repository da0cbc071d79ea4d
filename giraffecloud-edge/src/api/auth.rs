//! Control-plane authentication.
//!
//! Identity is an external collaborator: the engine only consumes an
//! authorizer that maps a bearer token to a user id. The default
//! implementation is a static token table from configuration; the hosted
//! control plane plugs its session service in behind the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{header, HeaderMap};
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::error::Error;
use crate::state::AppState;

#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn user_for_token(&self, token: &str) -> Option<i64>;
}

pub struct StaticTokenAuthorizer {
    tokens: HashMap<String, i64>,
}

impl StaticTokenAuthorizer {
    pub fn from_config(config: &Config) -> Result<Self, String> {
        Ok(Self {
            tokens: config.parse_api_tokens()?,
        })
    }
}

#[async_trait::async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn user_for_token(&self, token: &str) -> Option<i64> {
        // Scan every entry so a miss costs the same as a hit.
        let mut found = None;
        for (candidate, user_id) in &self.tokens {
            let a = candidate.as_bytes();
            let b = token.as_bytes();
            if a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1 {
                found = Some(*user_id);
            }
        }
        found
    }
}

/// Bearer credential from an Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
}

/// Resolve the calling user or fail with `Unauthenticated`.
pub async fn require_user(state: &Arc<AppState>, headers: &HeaderMap) -> Result<i64, Error> {
    let token = bearer_token(headers)
        .ok_or_else(|| Error::Unauthenticated("missing bearer token".into()))?;
    state
        .authorizer
        .user_for_token(token)
        .await
        .ok_or_else(|| Error::Unauthenticated("invalid bearer token".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn static_authorizer_maps_tokens() {
        let mut config = Config::parse_from(["giraffecloud-edge"]);
        config.api_tokens = vec!["3:alpha-token-0123456789".into(), "9:beta-token-0123456789".into()];
        let authorizer = StaticTokenAuthorizer::from_config(&config).unwrap();
        assert_eq!(authorizer.user_for_token("alpha-token-0123456789").await, Some(3));
        assert_eq!(authorizer.user_for_token("beta-token-0123456789").await, Some(9));
        assert_eq!(authorizer.user_for_token("gamma-token-123456789").await, None);
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.remove(header::AUTHORIZATION);
        assert_eq!(bearer_token(&headers), None);
    }
}
