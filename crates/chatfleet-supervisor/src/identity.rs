// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable caller-to-instance identity registry.
//!
//! Maps an administrative caller's session identifier to the worker
//! instance it owns. Loaded at boot, written through after every
//! mutation. Write failures are logged and the in-memory map stays
//! authoritative until the next successful write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// One registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityEntry {
    /// Instance the caller owns.
    pub instance_id: String,
    /// Last time the caller was heard from.
    pub last_seen: DateTime<Utc>,
}

/// The caller-to-instance registry with its backing file.
pub struct IdentityRegistry {
    path: PathBuf,
    entries: Mutex<HashMap<String, IdentityEntry>>,
}

impl IdentityRegistry {
    /// Load the registry from disk, starting empty if the file does not
    /// exist or cannot be parsed.
    pub async fn load(path: &Path) -> Self {
        let entries = match tokio::fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str::<HashMap<String, IdentityEntry>>(&content) {
                Ok(map) => {
                    debug!(count = map.len(), "loaded identity registry");
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt identity registry, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        }
    }

    /// Bind a caller to an instance, replacing any previous binding.
    pub async fn claim(&self, caller_id: &str, instance_id: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            caller_id.to_string(),
            IdentityEntry {
                instance_id: instance_id.to_string(),
                last_seen: Utc::now(),
            },
        );
        self.flush(&entries).await;
    }

    /// Refresh a caller's last-seen timestamp. No-op for unknown callers.
    pub async fn touch(&self, caller_id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(caller_id) {
            entry.last_seen = Utc::now();
            self.flush(&entries).await;
        }
    }

    /// Look up the instance a caller owns.
    pub async fn lookup(&self, caller_id: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries.get(caller_id).map(|e| e.instance_id.clone())
    }

    /// Remove a caller's binding.
    pub async fn remove(&self, caller_id: &str) {
        let mut entries = self.entries.lock().await;
        if entries.remove(caller_id).is_some() {
            self.flush(&entries).await;
        }
    }

    /// Remove every binding that points at the given instance. Used when
    /// an instance is deleted.
    pub async fn remove_instance(&self, instance_id: &str) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.instance_id != instance_id);
        if entries.len() != before {
            self.flush(&entries).await;
        }
    }

    /// Re-point every binding from one instance id to another. Used on
    /// identity promotion so callers follow the permanent id.
    pub async fn rebind_instance(&self, from: &str, to: &str) {
        let mut entries = self.entries.lock().await;
        let mut changed = false;
        for entry in entries.values_mut() {
            if entry.instance_id == from {
                entry.instance_id = to.to_string();
                changed = true;
            }
        }
        if changed {
            self.flush(&entries).await;
        }
    }

    async fn flush(&self, entries: &HashMap<String, IdentityEntry>) {
        if let Err(e) = self.write_file(entries).await {
            warn!(path = %self.path.display(), error = %e, "failed to persist identity registry");
        }
    }

    async fn write_file(&self, entries: &HashMap<String, IdentityEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity_registry.json");

        let registry = IdentityRegistry::load(&path).await;
        registry.claim("caller-1", "wa-19995550123-abc12345").await;

        let reloaded = IdentityRegistry::load(&path).await;
        assert_eq!(
            reloaded.lookup("caller-1").await.as_deref(),
            Some("wa-19995550123-abc12345")
        );
    }

    #[tokio::test]
    async fn test_remove_instance_drops_all_owners() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity_registry.json");

        let registry = IdentityRegistry::load(&path).await;
        registry.claim("caller-1", "w1").await;
        registry.claim("caller-2", "w1").await;
        registry.claim("caller-3", "w2").await;

        registry.remove_instance("w1").await;

        assert!(registry.lookup("caller-1").await.is_none());
        assert!(registry.lookup("caller-2").await.is_none());
        assert_eq!(registry.lookup("caller-3").await.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_rebind_instance_follows_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity_registry.json");

        let registry = IdentityRegistry::load(&path).await;
        registry.claim("caller-1", "linking-abc12345").await;
        registry
            .rebind_instance("linking-abc12345", "wa-19995550123-abc12345")
            .await;

        assert_eq!(
            registry.lookup("caller-1").await.as_deref(),
            Some("wa-19995550123-abc12345")
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity_registry.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let registry = IdentityRegistry::load(&path).await;
        assert!(registry.lookup("caller-1").await.is_none());
    }
}
