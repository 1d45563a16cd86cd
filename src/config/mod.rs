//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (merged last by the binary)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeterError, Result};
use crate::proxy::RequestKind;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Usage ledger configuration
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MeterError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| MeterError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay environment variables onto an existing configuration
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("OPENAI_KEY").or_else(|_| std::env::var("OPENAI_API_KEY")) {
            if !key.is_empty() {
                self.proxy.api_key = Some(key);
            }
        }
        if let Ok(upstream) = std::env::var("GPT_METER_UPSTREAM") {
            self.proxy.upstream_url = upstream;
        }
        if let Ok(host) = std::env::var("GPT_METER_HOST") {
            self.proxy.host = host;
        }
        if let Ok(port) = std::env::var("GPT_METER_PORT") {
            if let Ok(port) = port.parse() {
                self.proxy.port = port;
            }
        }
        if let Ok(kind) = std::env::var("GPT_METER_REQUEST_KIND") {
            if let Ok(kind) = kind.parse() {
                self.proxy.request_kind = kind;
            }
        }
        if let Ok(secs) = std::env::var("GPT_METER_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.proxy.timeout_secs = secs;
            }
        }
        if let Ok(path) = std::env::var("GPT_METER_DB") {
            self.store.path = PathBuf::from(path);
        }
    }
}

/// Proxy server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream API base URL (e.g., https://api.openai.com)
    pub upstream_url: String,

    /// Credential sent upstream in place of the caller's key
    pub api_key: Option<String>,

    /// Request shape accepted by this deployment
    pub request_kind: RequestKind,

    /// Port to listen on
    pub port: u16,

    /// Host to bind to
    pub host: String,

    /// Per-call deadline in seconds, covering the upstream round trip and relay
    pub timeout_secs: u64,

    /// Maximum inbound request body size in bytes
    pub max_body_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_url: "https://api.openai.com".to_string(),
            api_key: None,
            request_kind: RequestKind::Chat,
            port: 8080,
            host: "127.0.0.1".to_string(),
            timeout_secs: 60,
            max_body_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

impl ProxyConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| MeterError::Config(format!("Invalid listen address: {e}")))
    }

    /// Full upstream URL for the configured request kind
    pub fn upstream_endpoint(&self) -> String {
        format!(
            "{}{}",
            self.upstream_url.trim_end_matches('/'),
            self.request_kind.path()
        )
    }

    /// Per-call deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Usage ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gpt-meter.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.upstream_url, "https://api.openai.com");
        assert_eq!(config.proxy.request_kind, RequestKind::Chat);
        assert_eq!(config.proxy.timeout(), Duration::from_secs(60));
        assert!(config.proxy.api_key.is_none());
        assert_eq!(config.store.path, PathBuf::from("gpt-meter.db"));
    }

    #[test]
    fn test_proxy_listen_addr() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr().unwrap().to_string(), "127.0.0.1:8080");

        let bad = ProxyConfig {
            host: "not a host".to_string(),
            ..ProxyConfig::default()
        };
        assert!(bad.listen_addr().is_err());
    }

    #[test]
    fn test_upstream_endpoint_follows_request_kind() {
        let mut config = ProxyConfig {
            upstream_url: "http://127.0.0.1:9000/".to_string(),
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.upstream_endpoint(),
            "http://127.0.0.1:9000/v1/chat/completions"
        );

        config.request_kind = RequestKind::Completion;
        assert_eq!(
            config.upstream_endpoint(),
            "http://127.0.0.1:9000/v1/completions"
        );
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [proxy]
            upstream_url = "https://llm.internal"
            api_key = "sk-upstream"
            request_kind = "completion"
            port = 9090
            timeout_secs = 30

            [store]
            path = "/var/lib/gpt-meter/usage.db"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.proxy.upstream_url, "https://llm.internal");
        assert_eq!(config.proxy.api_key.as_deref(), Some("sk-upstream"));
        assert_eq!(config.proxy.request_kind, RequestKind::Completion);
        assert_eq!(config.proxy.port, 9090);
        assert_eq!(config.proxy.timeout_secs, 30);
        // Unset keys keep their defaults
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.store.path, PathBuf::from("/var/lib/gpt-meter/usage.db"));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpt-meter.toml");
        std::fs::write(&path, "[proxy]\nport = 7000\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.proxy.port, 7000);

        let missing = Config::from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(MeterError::Config(_))));
    }
}
