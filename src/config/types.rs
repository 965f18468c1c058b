//! Core configuration types.

use crate::config::{AccessConfig, LimitsConfig, ListenConfig};
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bouncer identity.
    pub bouncer: BouncerConfig,
    /// Listeners to open at startup. May be empty; listeners can also
    /// be opened later through the demultiplexer API.
    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenConfig>,
    /// Replay buffer limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Connection-origin policy.
    #[serde(default)]
    pub access: AccessConfig,
}

/// Bouncer identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BouncerConfig {
    /// Hostname used in server prefixes and rejection lines
    /// (e.g. "tether.in").
    pub name: String,
    /// Name of the default network downstream clients attach to.
    #[serde(default = "default_network_name")]
    pub network: String,
}

fn default_network_name() -> String {
    "default".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_deserializes_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [bouncer]
            name = "tether.in"
        "#,
        )
        .unwrap();
        assert_eq!(cfg.bouncer.name, "tether.in");
        assert_eq!(cfg.bouncer.network, "default");
        assert!(cfg.listeners.is_empty());
        assert_eq!(cfg.limits.buffer_size, 50);
        assert_eq!(cfg.limits.max_buffer_size, 500);
    }

    #[test]
    fn full_config_deserializes() {
        let cfg: Config = toml::from_str(
            r#"
            [bouncer]
            name = "tether.in"
            network = "libera"

            [[listener]]
            address = "127.0.0.1:6667"
            accept = "irc"

            [[listener]]
            address = "127.0.0.1:8080"
            accept = "http"

            [limits]
            buffer_size = 100
            max_buffer_size = 1000

            [access]
            deny_hosts = ["10.0.0.*"]
            max_anonymous_per_host = 5
        "#,
        )
        .unwrap();
        assert_eq!(cfg.listeners.len(), 2);
        assert_eq!(cfg.limits.buffer_size, 100);
        assert_eq!(cfg.access.max_anonymous_per_host, 5);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bouncer]\nname = \"t.example\"\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.bouncer.name, "t.example");
    }

    #[test]
    fn load_rejects_missing_file() {
        assert!(Config::load("/nonexistent/tetherd.toml").is_err());
    }
}
