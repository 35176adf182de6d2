// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for chatfleet-supervisor.

use thiserror::Error;

/// Supervisor errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Worker spawn/signal operation failed.
    #[error("Spawn error: {0}")]
    Spawn(#[from] crate::spawner::SpawnError),

    /// Control-plane framing failed.
    #[error("Frame error: {0}")]
    Frame(#[from] chatfleet_protocol::FrameError),

    /// Instance was not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using supervisor Error.
pub type Result<T> = std::result::Result<T, Error>;
