//! Configuration for the Zaku server.
//!
//! Loads a structured TOML file into typed structs with `serde` + `toml`.
//! Every field has a default so a missing file (or a partial one) still
//! yields a runnable config; CLI flags and the `ZAKU_USER` / `ZAKU_KEY`
//! environment variables are applied on top by the binary.
//!
//! # Example `zaku.toml`
//! ```toml
//! [server]
//! host            = "0.0.0.0"
//! port            = 9000
//! free_port       = false
//! max_frame_bytes = 67_108_864   # 64 MiB
//!
//! [store]
//! prefix = "zaku"
//!
//! [queues]
//! default_ttl_seconds = 5.0
//!
//! [delivery]
//! outbound_buffer = 1024
//! ```

use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Kill the previous holder of the port before binding.
    pub free_port: bool,
    /// Frames larger than this are a connection-level error.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            free_port: false,
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// Namespace prefix for every key and channel.
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: "zaku".to_string(),
        }
    }
}

/// Shared-secret credentials. Auth is enforced only when both are set.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub user: Option<String>,
    pub key: Option<String>,
}

impl AuthConfig {
    pub fn required(&self) -> bool {
        self.user.is_some() && self.key.is_some()
    }

    pub fn matches(&self, user: &str, key: &str) -> bool {
        self.user.as_deref() == Some(user) && self.key.as_deref() == Some(key)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// Claim TTL applied when `ADD` carries none, in seconds.
    pub default_ttl_seconds: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 5.0,
        }
    }
}

/// Outbound delivery tuning.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Frames buffered per connection before events start dropping.
    pub outbound_buffer: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub queues: QueueConfig,
    pub delivery: DeliveryConfig,
}

impl Config {
    /// Pull `ZAKU_USER` / `ZAKU_KEY` from the environment, overriding any
    /// file-provided credentials.
    pub fn apply_env(&mut self) {
        if let Ok(user) = std::env::var("ZAKU_USER") {
            self.auth.user = Some(user);
        }
        if let Ok(key) = std::env::var("ZAKU_KEY") {
            self.auth.key = Some(key);
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let raw = fs::read_to_string(&path)?;
    let cfg: Config = toml::from_str(&raw)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let cfg = Config::default();
        assert_eq!(cfg.server.bind_addr(), "0.0.0.0:9000");
        assert_eq!(cfg.store.prefix, "zaku");
        assert!(!cfg.auth.required());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: Config = toml::from_str("[server]\nport = 9100\n").unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.queues.default_ttl_seconds, 5.0);
    }

    #[test]
    fn auth_requires_both_credentials() {
        let mut auth = AuthConfig::default();
        auth.user = Some("alice".into());
        assert!(!auth.required());
        auth.key = Some("secret".into());
        assert!(auth.required());
        assert!(auth.matches("alice", "secret"));
        assert!(!auth.matches("alice", "wrong"));
    }
}
