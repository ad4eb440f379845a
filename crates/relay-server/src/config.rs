//! Hub configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the hub server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8080`; `0` auto-assigns).
    pub port: u16,
    /// Shared secret for client token verification.
    pub jwt_secret: String,
    /// Bearer token protecting the admin HTTP API.
    pub admin_token: String,
    /// External handler process invocation.
    pub handler: HandlerConfig,
    /// Directory for handler payload files.
    pub temp_dir: PathBuf,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Per-client send lane capacity, in frames.
    pub lane_capacity: usize,
    /// Transport heartbeat ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Seconds without any inbound frame before the session closes.
    pub read_timeout_secs: u64,
    /// Per-send write deadline in milliseconds.
    pub send_timeout_ms: u64,
    /// Overall deadline for collecting one broadcast, in milliseconds.
    pub broadcast_deadline_ms: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Verbose logging.
    pub debug: bool,
}

/// How to invoke the external handler process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Working directory for the handler invocation.
    pub working_dir: PathBuf,
    /// Handler binary path.
    pub binary: String,
    /// Command name passed as the first argument.
    pub command: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            jwt_secret: String::new(),
            admin_token: String::new(),
            handler: HandlerConfig {
                working_dir: PathBuf::from("."),
                binary: "php".into(),
                command: "socket:handle".into(),
            },
            temp_dir: std::env::temp_dir().join("socket-server-payloads"),
            max_connections: 4096,
            lane_capacity: 128,
            heartbeat_interval_secs: 30,
            read_timeout_secs: 60,
            send_timeout_ms: 500,
            broadcast_deadline_ms: 1000,
            max_message_size: 512 * 1024,
            debug: false,
        }
    }
}

/// Configuration rejected before the listener starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("JWT secret cannot be empty")]
    EmptyJwtSecret,
    #[error("admin HTTP token cannot be empty")]
    EmptyAdminToken,
    #[error("lane capacity must be at least 1")]
    ZeroLaneCapacity,
}

impl HubConfig {
    /// Validate before binding; failure is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::EmptyJwtSecret);
        }
        if self.admin_token.is_empty() {
            return Err(ConfigError::EmptyAdminToken);
        }
        if self.lane_capacity == 0 {
            return Err(ConfigError::ZeroLaneCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> HubConfig {
        HubConfig {
            jwt_secret: "s".into(),
            admin_token: "t".into(),
            ..HubConfig::default()
        }
    }

    #[test]
    fn defaults() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.lane_capacity, 128);
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert_eq!(cfg.read_timeout_secs, 60);
        assert_eq!(cfg.send_timeout_ms, 500);
        assert_eq!(cfg.broadcast_deadline_ms, 1000);
        assert_eq!(cfg.max_message_size, 512 * 1024);
        assert!(cfg.temp_dir.ends_with("socket-server-payloads"));
    }

    #[test]
    fn empty_secret_rejected() {
        let cfg = HubConfig {
            jwt_secret: String::new(),
            ..valid()
        };
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::EmptyJwtSecret);
    }

    #[test]
    fn empty_admin_token_rejected() {
        let cfg = HubConfig {
            admin_token: String::new(),
            ..valid()
        };
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::EmptyAdminToken);
    }

    #[test]
    fn zero_lane_capacity_rejected() {
        let cfg = HubConfig {
            lane_capacity: 0,
            ..valid()
        };
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::ZeroLaneCapacity);
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = valid();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: HubConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.handler.binary, cfg.handler.binary);
        assert_eq!(back.temp_dir, cfg.temp_dir);
    }
}
