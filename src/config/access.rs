//! Connection-origin policy configuration.

use serde::Deserialize;

/// Allow/deny lists and the anonymous-connection throttle consulted by
/// the demultiplexer before any session handoff.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Host patterns allowed to connect. Empty means all hosts are
    /// allowed (subject to `deny_hosts`). Patterns support `*` and `?`.
    #[serde(default)]
    pub allow_hosts: Vec<String>,
    /// Host patterns always refused. Checked before `allow_hosts`.
    #[serde(default)]
    pub deny_hosts: Vec<String>,
    /// Maximum simultaneous unclassified connections per source host.
    #[serde(default = "default_max_anonymous")]
    pub max_anonymous_per_host: usize,
}

fn default_max_anonymous() -> usize {
    10
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            allow_hosts: Vec::new(),
            deny_hosts: Vec::new(),
            max_anonymous_per_host: default_max_anonymous(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_defaults() {
        let access = AccessConfig::default();
        assert!(access.allow_hosts.is_empty());
        assert!(access.deny_hosts.is_empty());
        assert_eq!(access.max_anonymous_per_host, 10);
    }

    #[test]
    fn access_deserialize() {
        let access: AccessConfig = toml::from_str(
            r#"
            allow_hosts = ["192.168.*"]
            deny_hosts = ["192.168.13.37"]
            max_anonymous_per_host = 3
        "#,
        )
        .unwrap();
        assert_eq!(access.allow_hosts, vec!["192.168.*"]);
        assert_eq!(access.max_anonymous_per_host, 3);
    }
}
