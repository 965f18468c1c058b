//! Replay buffer limits.

use serde::Deserialize;

/// Process-wide replay buffer limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Default capacity of a newly created replay buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Ceiling for `set_capacity` without force. Administrative paths
    /// may force past it.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
}

fn default_buffer_size() -> usize {
    50
}

fn default_max_buffer_size() -> usize {
    500
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_buffer_size: default_max_buffer_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_defaults() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.buffer_size, 50);
        assert_eq!(limits.max_buffer_size, 500);
    }

    #[test]
    fn limits_deserialize_partial() {
        let limits: LimitsConfig = toml::from_str("buffer_size = 200").unwrap();
        assert_eq!(limits.buffer_size, 200);
        assert_eq!(limits.max_buffer_size, 500);
    }
}
