//! Deterministic subdomain generation.
//!
//! When a tunnel is created without an explicit domain, the server
//! synthesizes one that is stable per user id: an HMAC-SHA256 of the user id
//! under `SUBDOMAIN_SECRET`, truncated and hex-encoded, below the base
//! domain from `CLIENT_URL`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Stable label for a user, e.g. `gc-94be7a31f0`.
pub fn subdomain_label(secret: &str, user_id: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(user_id.to_string().as_bytes());
    let digest = mac.finalize().into_bytes();
    format!("gc-{}", hex::encode(&digest[..5]))
}

/// Full generated domain under the configured base domain.
pub fn generated_domain(secret: &str, user_id: i64, base_domain: &str) -> String {
    format!("{}.{}", subdomain_label(secret, user_id), base_domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_per_user() {
        let a = generated_domain("secret", 42, "giraffecloud.xyz");
        let b = generated_domain("secret", 42, "giraffecloud.xyz");
        assert_eq!(a, b);
        assert!(a.ends_with(".giraffecloud.xyz"));
        assert!(a.starts_with("gc-"));
    }

    #[test]
    fn distinct_users_get_distinct_labels() {
        assert_ne!(
            subdomain_label("secret", 1),
            subdomain_label("secret", 2)
        );
    }

    #[test]
    fn secret_changes_the_label() {
        assert_ne!(
            subdomain_label("secret-a", 1),
            subdomain_label("secret-b", 1)
        );
    }
}
