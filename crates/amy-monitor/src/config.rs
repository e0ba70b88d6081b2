//! Collector service configuration.

use serde::Deserialize;

/// Top-level monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Listen address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Ring buffer capacity (FIFO eviction beyond this).
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,
    /// Events replayed to a freshly connected WebSocket subscriber.
    #[serde(default = "default_replay_count")]
    pub replay_count: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8600
}

fn default_ring_buffer_size() -> usize {
    500
}

fn default_replay_count() -> usize {
    50
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ring_buffer_size: default_ring_buffer_size(),
            replay_count: default_replay_count(),
        }
    }
}

impl MonitorConfig {
    /// Load config from `AMY_MONITOR_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("AMY_MONITOR_HOST").unwrap_or_else(|_| default_host()),
            port: std::env::var("AMY_MONITOR_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_port),
            ring_buffer_size: std::env::var("AMY_DATAFLOW_RING_BUFFER_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_ring_buffer_size),
            replay_count: std::env::var("AMY_DATAFLOW_REPLAY_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_replay_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8600);
        assert_eq!(config.ring_buffer_size, 500);
        assert_eq!(config.replay_count, 50);
    }
}
