//! Session timing and buffer presets.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by every window of a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between server heartbeats (ms).
    pub heartbeat_interval_ms: u64,
    /// Silence after which a window counts as degraded (ms).
    pub liveness_timeout_ms: u64,
    /// Missed heartbeats before the transport is dropped.
    pub reconnect_after_missed: u32,
    /// Missed heartbeats before the window is destroyed.
    pub destroy_after_missed: u32,
    /// Bytes of unacknowledged frames kept for replay.
    pub replay_buffer_bytes: usize,
    /// Largest client message accepted.
    pub max_client_message_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl SessionConfig {
    /// Standard configuration for production use.
    pub fn standard() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            liveness_timeout_ms: 4_000,
            reconnect_after_missed: 3,
            destroy_after_missed: 30,
            replay_buffer_bytes: 1024 * 1024,
            max_client_message_bytes: 64 * 1024,
        }
    }

    /// Short timings for tests.
    pub fn testing() -> Self {
        Self {
            heartbeat_interval_ms: 10,
            liveness_timeout_ms: 40,
            reconnect_after_missed: 2,
            destroy_after_missed: 5,
            replay_buffer_bytes: 64 * 1024,
            max_client_message_bytes: 16 * 1024,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the liveness timeout.
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how many missed heartbeats drop the transport and destroy the window.
    pub fn with_missed_limits(mut self, reconnect: u32, destroy: u32) -> Self {
        self.reconnect_after_missed = reconnect;
        self.destroy_after_missed = destroy;
        self
    }

    /// Set the replay buffer size.
    pub fn with_replay_buffer_bytes(mut self, bytes: usize) -> Self {
        self.replay_buffer_bytes = bytes;
        self
    }

    /// Set the largest accepted client message.
    pub fn with_max_client_message_bytes(mut self, bytes: usize) -> Self {
        self.max_client_message_bytes = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let standard = SessionConfig::default();
        assert_eq!(standard.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(standard.liveness_timeout(), Duration::from_secs(4));
        assert!(SessionConfig::testing().liveness_timeout() < standard.liveness_timeout());
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::standard()
            .with_heartbeat_interval(Duration::from_millis(250))
            .with_missed_limits(1, 2)
            .with_replay_buffer_bytes(10);
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.reconnect_after_missed, 1);
        assert_eq!(config.destroy_after_missed, 2);
        assert_eq!(config.replay_buffer_bytes, 10);
    }
}
