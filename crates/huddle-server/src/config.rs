//! Server configuration.

use std::path::Path;
use std::time::Duration;

use huddle_room::RoomCleanupPolicy;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Configuration for the signaling server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Outbound frames buffered per session before new ones are dropped.
    pub max_send_queue: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a session after this many seconds without a pong or frame.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    pub room_cleanup: RoomCleanupPolicy,
    /// How often the reaper sweeps empty rooms.
    pub reap_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
            room_cleanup: RoomCleanupPolicy::RemoveWhenEmpty,
            reap_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ServerError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.max_send_queue, 256);
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert_eq!(cfg.heartbeat_timeout_secs, 90);
        assert_eq!(cfg.room_cleanup, RoomCleanupPolicy::RemoveWhenEmpty);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig {
            port: 8443,
            room_cleanup: RoomCleanupPolicy::Retain,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{"port":3000,"room_cleanup":"retain"}"#).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.room_cleanup, RoomCleanupPolicy::Retain);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.reap_interval_secs, 60);
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 0,
            reap_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(cfg.reap_interval(), Duration::from_secs(1));
    }

    #[test]
    fn from_file_reads_json() {
        let path = std::env::temp_dir().join(format!("huddle-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"host":"0.0.0.0","max_send_queue":8}"#).unwrap();
        let cfg = ServerConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.max_send_queue, 8);
    }

    #[test]
    fn from_file_reports_errors() {
        let missing = ServerConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(missing, ServerError::ConfigRead { .. }));

        let path = std::env::temp_dir().join(format!("huddle-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let bad = ServerConfig::from_file(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(bad, ServerError::ConfigParse { .. }));
    }
}
