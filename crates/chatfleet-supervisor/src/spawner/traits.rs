// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spawner trait definitions.
//!
//! Defines the abstract interface for launching worker processes.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::instance::Credentials;

/// Errors from spawner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpawnError {
    /// Worker executable was not found.
    #[error("Worker binary not found: {0}")]
    BinaryNotFound(String),

    /// Process failed to start.
    #[error("Spawn failed: {0}")]
    StartFailed(String),

    /// Signal delivery failed.
    #[error("Signal failed for pid {pid}: {message}")]
    SignalFailed {
        /// Target process id.
        pid: u32,
        /// OS error text.
        message: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for spawner operations.
pub type Result<T> = std::result::Result<T, SpawnError>;

/// Options for launching a worker process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Instance ID the worker will report under
    pub instance_id: String,
    /// Dedicated data directory for this instance
    pub instance_dir: PathBuf,
    /// Control-plane address the worker connects back to
    pub control_addr: String,
    /// External-API credentials passed through the environment
    pub credentials: Credentials,
    /// Phone number, if already known (restart/boot recovery)
    pub phone_number: Option<String>,
}

/// Handle for a launched worker process.
///
/// Deliberately does not own the child: the waiter task inside the
/// spawner owns it and reports the exit as a [`ChildEvent`].
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Unique identifier for this launch
    pub handle_id: String,
    /// Instance ID
    pub instance_id: String,
    /// OS process id, if the spawner runs real processes
    pub pid: Option<u32>,
    /// When the process was started
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Events a spawner delivers back to the supervisor's event loop.
#[derive(Debug, Clone)]
pub enum ChildEvent {
    /// One trimmed line of worker stdout/stderr.
    Output {
        /// Instance the line came from.
        instance_id: String,
        /// The output line.
        line: String,
    },
    /// The process exited; `code` is `None` when killed by signal.
    Exited {
        /// Instance whose process exited.
        instance_id: String,
        /// Exit code, if the process was not signal-killed.
        code: Option<i32>,
    },
}

/// Trait for worker spawners.
///
/// Spawners are pure process engines: they launch, signal, and observe
/// workers, and never touch the instance table or any on-disk state
/// beyond the process itself.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Spawner type identifier (e.g., "process", "mock")
    fn spawner_type(&self) -> &'static str;

    /// Launch a worker process without waiting for it.
    async fn spawn(&self, options: &SpawnOptions) -> Result<WorkerHandle>;

    /// Check whether the handle's process is still running.
    async fn is_running(&self, handle: &WorkerHandle) -> bool;

    /// Request graceful termination (SIGTERM or equivalent).
    async fn terminate(&self, handle: &WorkerHandle) -> Result<()>;

    /// Forcibly kill the process (SIGKILL or equivalent).
    async fn kill(&self, handle: &WorkerHandle) -> Result<()>;
}
