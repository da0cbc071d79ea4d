use std::collections::HashMap;

use clap::Parser;

/// GiraffeCloud edge server.
///
/// Terminates public HTTPS for user-owned domains (behind an automatic-HTTPS
/// fronting proxy) and relays each request to the agent connected for that
/// domain over a multiplexed tunnel stream.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Listen address for public tunnel traffic
    #[arg(long, env = "GIRAFFE_EDGE_PUBLIC_ADDR", default_value = "0.0.0.0:8080")]
    pub public_addr: String,

    /// Listen address for the control-plane API and the agent endpoint
    #[arg(long, env = "GIRAFFE_EDGE_API_ADDR", default_value = "0.0.0.0:8081")]
    pub api_addr: String,

    /// SQLite database path (omit for a volatile in-memory store)
    #[arg(long, env = "GIRAFFE_EDGE_DATABASE")]
    pub database: Option<String>,

    /// Control-plane API tokens as "user_id:token" pairs
    #[arg(long, env = "GIRAFFE_EDGE_API_TOKENS", value_delimiter = ',')]
    pub api_tokens: Vec<String>,

    /// Dashboard URL; its host is the base domain for generated subdomains
    #[arg(long, env = "CLIENT_URL", default_value = "https://giraffecloud.xyz")]
    pub client_url: String,

    /// HMAC key for deterministic subdomain generation
    #[arg(long, env = "SUBDOMAIN_SECRET", default_value = "insecure-dev-secret")]
    pub subdomain_secret: String,

    /// Fallback monthly byte limit when the user has no plan (100 GiB)
    #[arg(
        long,
        env = "QUOTA_DEFAULT_MONTHLY_BYTES",
        default_value_t = 100 * 1024 * 1024 * 1024
    )]
    pub quota_default_monthly_bytes: i64,

    /// Fraction of the limit at which quota decisions turn to warn
    #[arg(long, env = "QUOTA_SOFT_WARN_PCT", default_value_t = 0.9)]
    pub quota_soft_warn_pct: f64,

    /// Quota decision cache TTL in seconds
    #[arg(long, env = "GIRAFFE_EDGE_QUOTA_CACHE_TTL", default_value_t = 30)]
    pub quota_cache_ttl_secs: u64,

    /// Quota decision cache capacity (entries)
    #[arg(long, env = "GIRAFFE_EDGE_QUOTA_CACHE_CAPACITY", default_value_t = 10_000)]
    pub quota_cache_capacity: usize,

    /// Body chunk size for streamed transfers in bytes
    #[arg(long, env = "CHUNK_SIZE_BYTES", default_value_t = 4 * 1024 * 1024)]
    pub chunk_size_bytes: usize,

    /// Small/large threshold in bytes; larger transfers take the streaming path
    #[arg(
        long,
        env = "LARGE_FILE_THRESHOLD_BYTES",
        default_value_t = 16 * 1024 * 1024
    )]
    pub large_file_threshold_bytes: u64,

    /// Session idle timeout in seconds; heartbeats run at a third of this
    #[arg(long, env = "GIRAFFE_EDGE_IDLE_TIMEOUT", default_value_t = 90)]
    pub idle_timeout_secs: u64,

    /// Deadline for the first response envelope in seconds
    #[arg(long, env = "GIRAFFE_EDGE_RESPONSE_METADATA_TIMEOUT", default_value_t = 60)]
    pub response_metadata_timeout_secs: u64,

    /// Maximum gap between response chunks in seconds
    #[arg(long, env = "GIRAFFE_EDGE_INTER_CHUNK_TIMEOUT", default_value_t = 120)]
    pub inter_chunk_timeout_secs: u64,

    /// Deadline for one write on the session stream in seconds
    #[arg(long, env = "GIRAFFE_EDGE_WRITE_DEADLINE", default_value_t = 5)]
    pub write_deadline_secs: u64,

    /// Drain window for in-flight requests on shutdown or eviction in seconds
    #[arg(long, env = "GIRAFFE_EDGE_DRAIN_WINDOW", default_value_t = 30)]
    pub drain_window_secs: u64,

    /// Usage flush interval in seconds
    #[arg(long, env = "GIRAFFE_EDGE_USAGE_FLUSH_INTERVAL", default_value_t = 30)]
    pub usage_flush_interval_secs: u64,

    /// Flush early once this many usage records accumulate
    #[arg(long, env = "GIRAFFE_EDGE_USAGE_FLUSH_WATERMARK", default_value_t = 1_000)]
    pub usage_flush_watermark: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GIRAFFE_EDGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "GIRAFFE_EDGE_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size_bytes == 0 {
            return Err("chunk size must be positive".into());
        }
        if (self.large_file_threshold_bytes as usize) < self.chunk_size_bytes {
            return Err("large-file threshold must be at least one chunk".into());
        }
        if !(0.0..=1.0).contains(&self.quota_soft_warn_pct) {
            return Err("quota soft-warn fraction must be within [0, 1]".into());
        }
        if self.base_domain().is_empty() {
            return Err("CLIENT_URL must contain a host".into());
        }
        self.parse_api_tokens()?;
        Ok(())
    }

    /// Base domain for generated subdomains, derived from `CLIENT_URL`.
    pub fn base_domain(&self) -> String {
        let host = self
            .client_url
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let host = host.split('/').next().unwrap_or("");
        let host = host.split(':').next().unwrap_or("");
        host.trim_start_matches("www.").to_ascii_lowercase()
    }

    /// Control-plane bearer tokens: "user_id:token" entries.
    pub fn parse_api_tokens(&self) -> Result<HashMap<String, i64>, String> {
        let mut map = HashMap::new();
        for entry in &self.api_tokens {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (user, token) = entry
                .split_once(':')
                .ok_or_else(|| format!("api token entry {entry:?} is not user_id:token"))?;
            let user_id: i64 = user
                .parse()
                .map_err(|_| format!("api token entry {entry:?} has a non-numeric user id"))?;
            if token.len() < 16 {
                return Err(format!("api token for user {user_id} is shorter than 16 chars"));
            }
            map.insert(token.to_string(), user_id);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["giraffecloud-edge"])
    }

    #[test]
    fn defaults_validate() {
        base_config().validate().unwrap();
    }

    #[test]
    fn base_domain_strips_scheme_port_and_path() {
        let mut config = base_config();
        config.client_url = "https://www.example.dev:8443/app".into();
        assert_eq!(config.base_domain(), "example.dev");
    }

    #[test]
    fn api_token_parsing() {
        let mut config = base_config();
        config.api_tokens = vec!["7:super-secret-token-value".into()];
        let map = config.parse_api_tokens().unwrap();
        assert_eq!(map.get("super-secret-token-value"), Some(&7));

        config.api_tokens = vec!["not-a-pair".into()];
        assert!(config.parse_api_tokens().is_err());
    }

    #[test]
    fn rejects_threshold_below_chunk_size() {
        let mut config = base_config();
        config.large_file_threshold_bytes = 1024;
        assert!(config.validate().is_err());
    }
}
