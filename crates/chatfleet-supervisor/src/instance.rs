// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory instance records and the per-instance config file.
//!
//! A [`WorkerInstance`] is one row of the supervisor's instance table.
//! The process handle lives inside the row and is owned exclusively by
//! the supervisor; the control server only ever sees status snapshots.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chatfleet_protocol::{InstanceSummary, WorkerStatus};

use crate::error::Result;
use crate::spawner::WorkerHandle;

/// Prefix of temporary linking-instance ids. Directories bearing it are
/// transient and never resumed at boot.
pub const LINKING_PREFIX: &str = "linking-";

/// Runtime status of a worker instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Process spawned, no report received yet.
    Starting,
    /// Worker is establishing its platform session.
    Connecting,
    /// Worker is waiting for a QR scan.
    Qr,
    /// Session is open.
    Connected,
    /// Graceful stop requested, force-kill timer armed.
    Stopping,
    /// Session or control socket lost.
    Disconnected,
    /// The account was logged out on the platform side.
    LoggedOut,
    /// The process exited; `None` means killed by signal.
    Exited(Option<i32>),
    /// Worker reported an unrecoverable error.
    Error,
}

impl InstanceStatus {
    /// Wire representation used in status broadcasts.
    pub fn as_wire(&self) -> String {
        match self {
            Self::Starting => "starting".to_string(),
            Self::Connecting => "connecting".to_string(),
            Self::Qr => "qr".to_string(),
            Self::Connected => "connected".to_string(),
            Self::Stopping => "stopping".to_string(),
            Self::Disconnected => "disconnected".to_string(),
            Self::LoggedOut => "logged_out".to_string(),
            Self::Exited(Some(code)) => format!("exited ({code})"),
            Self::Exited(None) => "exited (signal)".to_string(),
            Self::Error => "error".to_string(),
        }
    }
}

impl From<WorkerStatus> for InstanceStatus {
    fn from(status: WorkerStatus) -> Self {
        match status {
            WorkerStatus::Starting => Self::Starting,
            WorkerStatus::Connecting => Self::Connecting,
            WorkerStatus::Qr => Self::Qr,
            WorkerStatus::Connected => Self::Connected,
            WorkerStatus::Disconnected => Self::Disconnected,
            WorkerStatus::LoggedOut => Self::LoggedOut,
            WorkerStatus::Error | WorkerStatus::Unknown => Self::Error,
        }
    }
}

/// Credentials a worker uses against the external platform API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// External-API username.
    #[serde(default)]
    pub api_user: String,
    /// External-API password.
    #[serde(default)]
    pub api_pass: String,
    /// Owner phone number, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_number: Option<String>,
}

/// Bounded ring buffer of recent worker output lines.
#[derive(Debug)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    /// Create an empty ring with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append one output line; empty lines are dropped, the oldest line
    /// is evicted once the buffer is full.
    pub fn push(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(trimmed.to_string());
    }

    /// Copy of the buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer holds no lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// One row of the supervisor's instance table.
#[derive(Debug)]
pub struct WorkerInstance {
    /// Stable instance identifier.
    pub instance_id: String,
    /// Linked account's phone number, once known.
    pub phone_number: Option<String>,
    /// Linked account's display name, once known.
    pub display_name: Option<String>,
    /// Current runtime status.
    pub status: InstanceStatus,
    /// External-API credentials passed to the worker.
    pub credentials: Credentials,
    /// Whether the id still bears the temporary linking prefix.
    pub is_linking_instance: bool,
    /// When the current (or last) process was started.
    pub started_at: DateTime<Utc>,
    /// When the status last changed.
    pub last_updated: DateTime<Utc>,
    /// Recent worker output lines.
    pub logs: LogRing,
    /// Live process handle; `None` once the exit has been observed.
    pub handle: Option<WorkerHandle>,
    /// Set while a force-kill timer is armed; at most one per instance.
    pub stop_timer_armed: bool,
}

impl WorkerInstance {
    /// Create a fresh row in `starting` state.
    pub fn new(instance_id: &str, log_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.to_string(),
            phone_number: None,
            display_name: None,
            status: InstanceStatus::Starting,
            credentials: Credentials::default(),
            is_linking_instance: instance_id.starts_with(LINKING_PREFIX),
            started_at: now,
            last_updated: now,
            logs: LogRing::new(log_capacity),
            handle: None,
            stop_timer_armed: false,
        }
    }

    /// Apply a status transition, refreshing the update timestamp.
    pub fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.last_updated = Utc::now();
    }

    /// Snapshot for an `instanceList` reply.
    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            instance_id: self.instance_id.clone(),
            status: self.status.as_wire(),
            phone_number: self.phone_number.clone(),
            name: self.display_name.clone(),
            is_linking_instance: self.is_linking_instance,
            started_at: self.started_at,
            last_updated: self.last_updated,
        }
    }
}

/// Per-instance config file, written at promotion time and read during
/// boot recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    /// Linked account's phone number.
    pub phone_number: String,
    /// Linked account's display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// External-API credentials.
    #[serde(default)]
    pub credentials: Credentials,
    /// Caller that requested the linking, if it identified itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// When the account was linked.
    pub linked_at: DateTime<Utc>,
}

impl InstanceConfig {
    /// File name inside the instance's data directory.
    pub const FILE_NAME: &'static str = "instance.json";

    /// Read the config from an instance directory.
    pub async fn read_from_dir(dir: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(dir.join(Self::FILE_NAME)).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the config into an instance directory.
    pub async fn write_to_dir(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(dir.join(Self::FILE_NAME), content).await?;
        Ok(())
    }
}
