use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// GiraffeCloud agent.
///
/// Runs on the private network, keeps a tunnel stream open to the edge, and
/// forwards received requests to a local HTTP origin.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Edge server URL (e.g. https://edge.giraffecloud.xyz)
    #[arg(long, env = "GIRAFFE_AGENT_SERVER_URL")]
    pub server_url: String,

    /// Tunnel token issued when the tunnel was created
    #[arg(long, env = "GIRAFFE_AGENT_TOKEN")]
    pub token: String,

    /// Local origin port requests are forwarded to
    #[arg(long, env = "GIRAFFE_AGENT_TARGET_PORT", default_value_t = 8000)]
    pub target_port: u16,

    /// Local origin host
    #[arg(long, env = "GIRAFFE_AGENT_TARGET_HOST", default_value = "127.0.0.1")]
    pub target_host: String,

    /// Origin request timeout in seconds
    #[arg(long, env = "GIRAFFE_AGENT_ORIGIN_TIMEOUT", default_value_t = 300)]
    pub origin_timeout_secs: u64,

    /// Edge TCP connect / handshake timeout in seconds
    #[arg(long, env = "GIRAFFE_AGENT_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// TCP keepalive on the tunnel socket in seconds (0 disables)
    #[arg(long, env = "GIRAFFE_AGENT_TCP_KEEPALIVE", default_value_t = 60)]
    pub tcp_keepalive_secs: u64,

    /// TCP_NODELAY on the tunnel socket
    #[arg(long, env = "GIRAFFE_AGENT_TCP_NODELAY", default_value_t = true)]
    pub tcp_nodelay: bool,

    /// Heartbeat interval in seconds (the edge hello may adjust it)
    #[arg(long, env = "GIRAFFE_AGENT_HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Reconnect when nothing arrives on the stream for this long (seconds)
    #[arg(long, env = "GIRAFFE_AGENT_STALE_TIMEOUT", default_value_t = 180)]
    pub stale_timeout_secs: u64,

    /// Cap on the reconnect backoff delay in seconds
    #[arg(long, env = "GIRAFFE_AGENT_RECONNECT_MAX_DELAY", default_value_t = 60)]
    pub reconnect_max_delay_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GIRAFFE_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "GIRAFFE_AGENT_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// Base URL of the local origin.
    pub fn origin_base(&self) -> String {
        format!("http://{}:{}", self.target_host, self.target_port)
    }
}

/// Serializable config for TOML file persistence, so a provisioned token
/// survives restarts. Only populated values are written.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Inject values as environment variables so clap picks them up,
    /// preserving the precedence CLI > env > config file.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!("GIRAFFE_AGENT_SERVER_URL", self.server_url);
        set!("GIRAFFE_AGENT_TOKEN", self.token);
        set!("GIRAFFE_AGENT_TARGET_PORT", self.target_port);
        set!("GIRAFFE_AGENT_TARGET_HOST", self.target_host);
        set!("GIRAFFE_AGENT_LOG_LEVEL", self.log_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_base_uses_host_and_port() {
        let config = Config::parse_from([
            "giraffecloud-agent",
            "--server-url",
            "https://edge.example",
            "--token",
            "t",
            "--target-port",
            "3000",
        ]);
        assert_eq!(config.origin_base(), "http://127.0.0.1:3000");
    }

    #[test]
    fn config_file_roundtrip() {
        let file = ConfigFile {
            server_url: Some("https://edge.example".into()),
            token: Some("secret".into()),
            target_port: Some(3000),
            target_host: None,
            log_level: None,
        };
        let toml_text = toml::to_string_pretty(&file).unwrap();
        assert!(!toml_text.contains("target_host"));
        let parsed: ConfigFile = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.server_url.as_deref(), Some("https://edge.example"));
        assert_eq!(parsed.target_port, Some(3000));
    }
}
