//! Connection-origin policy.
//!
//! Two gates run before a connection is classified: host allow/deny
//! patterns, and a per-host ceiling on simultaneous unclassified
//! connections. The ceiling counts live connections, not a rate; a
//! slot is released the moment its connection is promoted or dropped.

use crate::config::AccessConfig;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Match `text` against a pattern where `*` matches any run of
/// characters and `?` matches exactly one.
pub fn wild_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let mut pi = 0;
    let mut ti = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;
    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(star_pos) = star {
            pi = star_pos + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    pattern[pi..].iter().all(|&c| c == '*')
}

/// Host gating and the anonymous-connection throttle.
pub struct AccessPolicy {
    config: AccessConfig,
    anonymous: Arc<DashMap<IpAddr, usize>>,
}

impl AccessPolicy {
    /// Build the policy from configuration.
    pub fn new(config: AccessConfig) -> Self {
        Self {
            config,
            anonymous: Arc::new(DashMap::new()),
        }
    }

    /// Whether connections from `host` are accepted at all. Deny
    /// patterns win over allow patterns; an empty allow list admits
    /// every host not denied.
    pub fn host_allowed(&self, host: &str) -> bool {
        if self
            .config
            .deny_hosts
            .iter()
            .any(|p| wild_match(p, host))
        {
            return false;
        }
        self.config.allow_hosts.is_empty()
            || self.config.allow_hosts.iter().any(|p| wild_match(p, host))
    }

    /// Claim an unclassified-connection slot for `ip`, or `None` when
    /// the host is already at its ceiling. The slot frees itself on
    /// drop.
    pub fn try_acquire_anonymous(&self, ip: IpAddr) -> Option<AnonymousSlot> {
        let mut count = self.anonymous.entry(ip).or_insert(0);
        if *count >= self.config.max_anonymous_per_host {
            return None;
        }
        *count += 1;
        drop(count);
        Some(AnonymousSlot {
            counts: Arc::clone(&self.anonymous),
            ip,
        })
    }

    /// Current unclassified-connection count for `ip`.
    pub fn anonymous_count(&self, ip: IpAddr) -> usize {
        self.anonymous.get(&ip).map(|c| *c).unwrap_or(0)
    }
}

/// One claimed unclassified-connection slot; releases on drop.
pub struct AnonymousSlot {
    counts: Arc<DashMap<IpAddr, usize>>,
    ip: IpAddr,
}

impl Drop for AnonymousSlot {
    fn drop(&mut self) {
        self.counts.remove_if_mut(&self.ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}
