// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for chatfleet-supervisor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Supervisor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the control-plane socket
    pub control_addr: SocketAddr,
    /// Address workers use to reach the control plane
    pub worker_addr: String,
    /// Root data directory for per-instance state
    pub data_dir: PathBuf,
    /// Worker executable (resolved via PATH unless absolute)
    pub worker_cmd: String,
    /// Grace period before a stopped worker is force-killed
    pub stop_grace: Duration,
    /// Settle delay between stop and relaunch on restart
    pub restart_settle: Duration,
    /// How long delete waits for the process to exit before removing data
    pub delete_grace: Duration,
    /// Capacity of each instance's log ring buffer
    pub log_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("CHATFLEET_CONTROL_PORT")
            .unwrap_or_else(|_| "7600".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let control_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let worker_addr = std::env::var("CHATFLEET_WORKER_ADDR")
            .unwrap_or_else(|_| format!("127.0.0.1:{port}"));

        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let worker_cmd = std::env::var("CHATFLEET_WORKER_CMD")
            .unwrap_or_else(|_| "chatfleet-worker".to_string());

        let stop_grace = Duration::from_secs(parse_var("CHATFLEET_STOP_GRACE_SECS", 10)?);
        let restart_settle = Duration::from_millis(parse_var("CHATFLEET_RESTART_SETTLE_MS", 1500)?);
        let delete_grace = Duration::from_secs(parse_var("CHATFLEET_DELETE_GRACE_SECS", 5)?);

        let log_capacity = parse_var("CHATFLEET_LOG_CAPACITY", 200)? as usize;

        Ok(Self {
            control_addr,
            worker_addr,
            data_dir,
            worker_cmd,
            stop_grace,
            restart_settle,
            delete_grace,
            log_capacity,
        })
    }

    /// Root directory holding one subdirectory per instance.
    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    /// Path to the durable identity-registry file.
    pub fn identity_registry_path(&self) -> PathBuf {
        self.data_dir.join("identity_registry.json")
    }
}

fn parse_var(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// An environment variable holds a non-numeric value.
    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config {
            control_addr: SocketAddr::from(([0, 0, 0, 0], 7600)),
            worker_addr: "127.0.0.1:7600".to_string(),
            data_dir: PathBuf::from(".data"),
            worker_cmd: "chatfleet-worker".to_string(),
            stop_grace: Duration::from_secs(10),
            restart_settle: Duration::from_millis(1500),
            delete_grace: Duration::from_secs(5),
            log_capacity: 200,
        };

        assert_eq!(config.instances_dir(), PathBuf::from(".data/instances"));
        assert_eq!(
            config.identity_registry_path(),
            PathBuf::from(".data/identity_registry.json")
        );
    }
}
