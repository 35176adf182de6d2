// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The fleet supervisor: process lifecycle and identity promotion.
//!
//! The supervisor is the exclusive owner of process handles and the
//! only writer of instance status. Child output and exits arrive on a
//! single event channel, so mutations for one instance id are applied
//! in order. State visible to the control server leaves this module
//! only as [`FleetEvent`]s and snapshot copies.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use chatfleet_protocol::{InstanceSummary, ServerEvent, StatusReport, WorkerStatus};

use crate::config::Config;
use crate::error::Result;
use crate::identity::IdentityRegistry;
use crate::instance::{
    Credentials, InstanceConfig, InstanceStatus, LINKING_PREFIX, WorkerInstance,
};
use crate::linking::{LinkStatus, LinkingSession};
use crate::promotion;
use crate::spawner::{ChildEvent, SpawnOptions, WorkerHandle, WorkerSpawner};

/// Events the supervisor publishes to the control server.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// Broadcast this event to every administrative peer.
    Broadcast(ServerEvent),
    /// An instance id changed on promotion; worker-socket bindings must
    /// follow.
    Promoted {
        /// The temporary id.
        from: String,
        /// The permanent id.
        to: String,
    },
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Termination requested, force-kill timer armed.
    Stopping,
    /// A stop is already in flight; no second timer was armed.
    AlreadyStopping,
    /// The instance is tracked but has no live process.
    NotRunning,
    /// The instance id is unknown.
    NotFound,
}

/// Outcome of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Tracked instance stopped and its data removed.
    Deleted,
    /// No tracked entry, but any residual directory was removed.
    DeletedUntracked,
    /// Data removal failed; the instance row reports `deletion_failed`.
    Failed,
}

/// The fleet supervisor.
pub struct FleetSupervisor {
    config: Config,
    spawner: Arc<dyn WorkerSpawner>,
    // Arc so stop's force-kill timer task can outlive the borrow
    instances: Arc<Mutex<HashMap<String, WorkerInstance>>>,
    linking: Mutex<LinkingSession>,
    identity: IdentityRegistry,
    events_tx: broadcast::Sender<FleetEvent>,
}

impl FleetSupervisor {
    /// Create a supervisor. Pair with [`Self::spawn_event_loop`] to
    /// consume the spawner's child events.
    pub fn new(
        config: Config,
        spawner: Arc<dyn WorkerSpawner>,
        identity: IdentityRegistry,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            spawner,
            instances: Arc::new(Mutex::new(HashMap::new())),
            linking: Mutex::new(LinkingSession::new()),
            identity,
            events_tx,
        })
    }

    /// Subscribe to fleet events.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events_tx.subscribe()
    }

    /// The durable caller-to-instance registry.
    pub fn identity(&self) -> &IdentityRegistry {
        &self.identity
    }

    /// Drive the child-event loop. Runs until the spawner side of the
    /// channel is dropped.
    pub fn spawn_event_loop(
        self: Arc<Self>,
        mut child_events: mpsc::UnboundedReceiver<ChildEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = self;
        tokio::spawn(async move {
            while let Some(event) = child_events.recv().await {
                match event {
                    ChildEvent::Output { instance_id, line } => {
                        supervisor.append_log(&instance_id, &line).await;
                    }
                    ChildEvent::Exited { instance_id, code } => {
                        supervisor.handle_exit(&instance_id, code).await;
                    }
                }
            }
            debug!("child event channel closed");
        })
    }

    fn publish(&self, event: FleetEvent) {
        // No subscribers is fine (e.g. before the server starts)
        let _ = self.events_tx.send(event);
    }

    fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.config.instances_dir().join(instance_id)
    }

    fn status_update(&self, instance: &WorkerInstance) -> FleetEvent {
        FleetEvent::Broadcast(ServerEvent::InstanceStatusUpdate {
            instance_id: instance.instance_id.clone(),
            status: instance.status.as_wire(),
            phone_number: instance.phone_number.clone(),
            name: instance.display_name.clone(),
            timestamp: instance.last_updated,
        })
    }

    /// Launch a worker for `instance_id`, creating its data directory.
    ///
    /// Idempotent: if a live process is already tracked for this id, the
    /// existing handle is returned and nothing is spawned.
    pub async fn launch(
        &self,
        instance_id: &str,
        phone_number: Option<&str>,
        force_fresh_credentials: bool,
        credentials: Credentials,
    ) -> Result<WorkerHandle> {
        {
            let instances = self.instances.lock().await;
            if let Some(instance) = instances.get(instance_id)
                && let Some(handle) = &instance.handle
                && self.spawner.is_running(handle).await
            {
                debug!(instance_id, "already running, returning existing handle");
                return Ok(handle.clone());
            }
        }

        let instance_dir = self.instance_dir(instance_id);
        if force_fresh_credentials {
            match tokio::fs::remove_dir_all(instance_dir.join("session")).await {
                Ok(()) => info!(instance_id, "cleared session credentials"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let options = SpawnOptions {
            instance_id: instance_id.to_string(),
            instance_dir,
            control_addr: self.config.worker_addr.clone(),
            credentials: credentials.clone(),
            phone_number: phone_number.map(|p| p.to_string()),
        };

        let handle = self.spawner.spawn(&options).await?;
        info!(instance_id, "worker launched");

        let event = {
            let mut instances = self.instances.lock().await;
            let instance = instances
                .entry(instance_id.to_string())
                .or_insert_with(|| WorkerInstance::new(instance_id, self.config.log_capacity));
            instance.phone_number = phone_number.map(|p| p.to_string());
            instance.credentials = credentials;
            instance.handle = Some(handle.clone());
            instance.stop_timer_armed = false;
            instance.started_at = Utc::now();
            instance.set_status(InstanceStatus::Starting);
            self.status_update(instance)
        };
        self.publish(event);

        Ok(handle)
    }

    /// Start a previously linked instance using its stored parameters.
    ///
    /// Falls back to the on-disk config file when the instance is
    /// tracked-but-stopped from boot recovery or not tracked at all.
    pub async fn start(&self, instance_id: &str) -> Result<WorkerHandle> {
        let stored = {
            let instances = self.instances.lock().await;
            instances
                .get(instance_id)
                .map(|i| (i.phone_number.clone(), i.credentials.clone()))
        };

        let (phone_number, credentials) = match stored {
            Some(stored) => stored,
            None => match InstanceConfig::read_from_dir(&self.instance_dir(instance_id)).await {
                Ok(config) => (Some(config.phone_number), config.credentials),
                Err(_) => {
                    return Err(crate::error::Error::InstanceNotFound(
                        instance_id.to_string(),
                    ));
                }
            },
        };

        self.launch(instance_id, phone_number.as_deref(), false, credentials)
            .await
    }

    /// Request graceful termination and arm the force-kill timer.
    ///
    /// Idempotent: a second call while a stop is in flight arms nothing.
    pub async fn stop(&self, instance_id: &str) -> StopOutcome {
        let (handle, event) = {
            let mut instances = self.instances.lock().await;
            let Some(instance) = instances.get_mut(instance_id) else {
                return StopOutcome::NotFound;
            };
            let Some(handle) = instance.handle.clone() else {
                return StopOutcome::NotRunning;
            };
            if instance.stop_timer_armed {
                return StopOutcome::AlreadyStopping;
            }
            instance.stop_timer_armed = true;
            instance.set_status(InstanceStatus::Stopping);
            (handle, self.status_update(instance))
        };
        self.publish(event);

        if let Err(e) = self.spawner.terminate(&handle).await {
            warn!(instance_id, error = %e, "graceful termination failed");
        }

        // At most one timer per instance; the armed flag above guards it
        let instances = self.instances.clone();
        let spawner = self.spawner.clone();
        let grace = self.config.stop_grace;
        let timer_instance = instance_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let stale = {
                let instances = instances.lock().await;
                instances
                    .get(&timer_instance)
                    .and_then(|i| i.handle.as_ref())
                    .filter(|h| h.handle_id == handle.handle_id)
                    .cloned()
            };
            if let Some(stale) = stale
                && spawner.is_running(&stale).await
            {
                warn!(instance_id = %timer_instance, "grace period expired, force-killing worker");
                if let Err(e) = spawner.kill(&stale).await {
                    error!(instance_id = %timer_instance, error = %e, "force kill failed");
                }
            }
        });

        StopOutcome::Stopping
    }

    /// Stop and relaunch under the same id with captured parameters.
    pub async fn restart(&self, instance_id: &str) -> Result<()> {
        let (phone_number, credentials) = {
            let instances = self.instances.lock().await;
            let Some(instance) = instances.get(instance_id) else {
                return Err(crate::error::Error::InstanceNotFound(
                    instance_id.to_string(),
                ));
            };
            (instance.phone_number.clone(), instance.credentials.clone())
        };

        self.stop(instance_id).await;
        tokio::time::sleep(self.config.restart_settle).await;

        // The entry may have been deleted while we slept
        let still_tracked = {
            let instances = self.instances.lock().await;
            instances.contains_key(instance_id)
        };
        if !still_tracked {
            debug!(instance_id, "instance removed during restart settle, skipping relaunch");
            return Ok(());
        }

        self.launch(instance_id, phone_number.as_deref(), false, credentials)
            .await?;
        Ok(())
    }

    /// Stop an instance and remove its on-disk data.
    ///
    /// An untracked id still gets its residual directory removed.
    pub async fn delete(&self, instance_id: &str) -> DeleteOutcome {
        let tracked = {
            let instances = self.instances.lock().await;
            instances.contains_key(instance_id)
        };

        if tracked {
            self.stop(instance_id).await;

            // Wait for the exit, bounded by the delete grace period
            let deadline = tokio::time::Instant::now() + self.config.delete_grace;
            loop {
                let running = {
                    let instances = self.instances.lock().await;
                    match instances.get(instance_id).and_then(|i| i.handle.clone()) {
                        Some(handle) => self.spawner.is_running(&handle).await,
                        None => false,
                    }
                };
                if !running || tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }

        let dir = self.instance_dir(instance_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!(instance_id, "instance data directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(instance_id, error = %e, "failed to remove instance data");
                let event = {
                    let mut instances = self.instances.lock().await;
                    instances.get_mut(instance_id).map(|instance| {
                        instance.set_status(InstanceStatus::Error);
                        FleetEvent::Broadcast(ServerEvent::InstanceStatusUpdate {
                            instance_id: instance.instance_id.clone(),
                            status: "deletion_failed".to_string(),
                            phone_number: instance.phone_number.clone(),
                            name: instance.display_name.clone(),
                            timestamp: instance.last_updated,
                        })
                    })
                };
                if let Some(event) = event {
                    self.publish(event);
                }
                return DeleteOutcome::Failed;
            }
        }

        {
            let mut instances = self.instances.lock().await;
            instances.remove(instance_id);
        }
        self.identity.remove_instance(instance_id).await;

        {
            let mut linking = self.linking.lock().await;
            if linking.owns(instance_id) {
                linking.reset();
            }
        }

        self.publish(FleetEvent::Broadcast(ServerEvent::InstanceDeleted {
            instance_id: instance_id.to_string(),
        }));

        if tracked {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::DeletedUntracked
        }
    }

    /// Scan the data directory at boot and resume linked instances.
    ///
    /// Directories still bearing the temporary linking prefix are
    /// transient and skipped. An instance is launched only if its
    /// session-credential directory is non-empty; otherwise it is
    /// registered stopped, since auto-starting it would begin a live QR
    /// handshake nobody asked for.
    pub async fn recover_on_boot(&self) -> Result<()> {
        let root = self.config.instances_dir();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&root).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let instance_id = entry.file_name().to_string_lossy().to_string();
            if instance_id.starts_with(LINKING_PREFIX) {
                debug!(instance_id, "skipping stale linking directory");
                continue;
            }

            let dir = entry.path();
            let (phone_number, display_name, credentials) =
                match InstanceConfig::read_from_dir(&dir).await {
                    Ok(config) => (
                        Some(config.phone_number),
                        config.display_name,
                        config.credentials,
                    ),
                    Err(_) => (
                        phone_from_instance_id(&instance_id),
                        None,
                        Credentials::default(),
                    ),
                };

            if dir_is_non_empty(&dir.join("session")).await {
                info!(instance_id, "recovering linked instance");
                match self
                    .launch(&instance_id, phone_number.as_deref(), false, credentials)
                    .await
                {
                    Ok(_) => {
                        // launch only knows phone and credentials; carry
                        // the display name from the config file over
                        let mut instances = self.instances.lock().await;
                        if let Some(instance) = instances.get_mut(&instance_id) {
                            instance.display_name = display_name;
                        }
                    }
                    Err(e) => error!(instance_id, error = %e, "boot recovery launch failed"),
                }
            } else {
                info!(instance_id, "no session credentials, registering stopped");
                let mut instances = self.instances.lock().await;
                let instance = instances
                    .entry(instance_id.clone())
                    .or_insert_with(|| WorkerInstance::new(&instance_id, self.config.log_capacity));
                instance.phone_number = phone_number;
                instance.display_name = display_name;
                instance.credentials = credentials;
                instance.set_status(InstanceStatus::Disconnected);
            }
        }

        Ok(())
    }

    /// Begin a fresh account-linking attempt (last request wins).
    ///
    /// Any temporary worker from a previous attempt is stopped first.
    pub async fn request_qr(&self, caller_id: Option<&str>) -> Result<String> {
        let previous = {
            let linking = self.linking.lock().await;
            if linking.status().is_terminal() {
                None
            } else {
                linking.instance_id().map(|i| i.to_string())
            }
        };
        if let Some(previous) = previous {
            info!(instance_id = %previous, "stopping previous linking worker");
            self.stop(&previous).await;
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let instance_id = format!("{LINKING_PREFIX}{}", &token[..8]);

        match self
            .launch(&instance_id, None, true, Credentials::default())
            .await
        {
            Ok(_) => {
                let snapshot = {
                    let mut linking = self.linking.lock().await;
                    linking.begin(&instance_id, caller_id);
                    linking.snapshot()
                };
                self.publish(FleetEvent::Broadcast(snapshot));
                Ok(instance_id)
            }
            Err(e) => {
                error!(error = %e, "failed to launch linking worker");
                let snapshot = {
                    let mut linking = self.linking.lock().await;
                    linking.fail(LinkStatus::Error, "Failed to start linking worker");
                    linking.snapshot()
                };
                self.publish(FleetEvent::Broadcast(snapshot));
                Err(e)
            }
        }
    }

    /// Point a caller's registry entry at an existing instance.
    pub async fn manual_relink(&self, caller_id: &str, instance_id: &str) {
        info!(caller_id, instance_id, "manual relink");
        self.identity.claim(caller_id, instance_id).await;
    }

    /// Snapshot of every tracked instance.
    pub async fn list_instances(&self) -> Vec<InstanceSummary> {
        let instances = self.instances.lock().await;
        let mut list: Vec<InstanceSummary> = instances.values().map(|i| i.summary()).collect();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }

    /// Snapshot of one instance's log ring buffer.
    pub async fn logs(&self, instance_id: &str) -> Option<Vec<String>> {
        let instances = self.instances.lock().await;
        instances.get(instance_id).map(|i| i.logs.snapshot())
    }

    /// Apply a worker status report, driving promotion and the linking
    /// session where relevant.
    pub async fn apply_worker_status(&self, instance_id: &str, report: &StatusReport) {
        let (known, is_linking) = {
            let mut instances = self.instances.lock().await;
            match instances.get_mut(instance_id) {
                Some(instance) => {
                    if let Some(phone) = &report.phone_number {
                        instance.phone_number = Some(phone.clone());
                    }
                    if let Some(name) = &report.name {
                        instance.display_name = Some(name.clone());
                    }
                    instance.set_status(InstanceStatus::from(report.status));
                    (true, instance.is_linking_instance)
                }
                None => (false, false),
            }
        };
        if !known {
            warn!(instance_id, "status report for untracked instance, ignoring");
            return;
        }

        if report.status == WorkerStatus::Connected && (is_linking || report.phone_number.is_some())
        {
            // Idempotent for permanent ids: refreshes the config file
            // and settles status without touching the directory
            self.promote(instance_id, report).await;
            return;
        }

        let event = {
            let instances = self.instances.lock().await;
            instances.get(instance_id).map(|i| self.status_update(i))
        };
        if let Some(event) = event {
            self.publish(event);
        }

        self.update_linking_from_status(instance_id, report).await;
    }

    async fn update_linking_from_status(&self, instance_id: &str, report: &StatusReport) {
        let snapshot = {
            let mut linking = self.linking.lock().await;
            if !linking.owns(instance_id) || linking.status().is_terminal() {
                return;
            }
            match report.status {
                WorkerStatus::Error | WorkerStatus::Unknown => {
                    linking.fail(LinkStatus::Error, &report.message);
                }
                WorkerStatus::LoggedOut => {
                    linking.fail(LinkStatus::DisconnectedLogout, &report.message);
                }
                WorkerStatus::Disconnected => {
                    linking.fail(LinkStatus::LinkingFailed, &report.message);
                }
                WorkerStatus::Starting | WorkerStatus::Connecting | WorkerStatus::Qr => {
                    linking.progress(&report.message);
                }
                // Connected is handled by promotion
                WorkerStatus::Connected => return,
            }
            linking.snapshot()
        };
        self.publish(FleetEvent::Broadcast(snapshot));
    }

    /// Identity promotion: temporary linking id -> permanent id.
    async fn promote(&self, temp_id: &str, report: &StatusReport) {
        let Some(phone_number) = report.phone_number.clone() else {
            // Without a phone number no permanent id can be derived. If
            // the temporary directory is gone as well there is nothing
            // to salvage; either way the attempt is a hard failure.
            error!(temp_id, "connected without a phone number, promotion failed");
            let snapshot = {
                let mut linking = self.linking.lock().await;
                if linking.owns(temp_id) {
                    linking.fail(LinkStatus::Error, "Linking finished without a phone number");
                    Some(linking.snapshot())
                } else {
                    None
                }
            };
            if let Some(snapshot) = snapshot {
                self.publish(FleetEvent::Broadcast(snapshot));
            }
            return;
        };

        let permanent_id = if temp_id.starts_with(LINKING_PREFIX) {
            promotion::permanent_id_for(&phone_number)
        } else {
            // Already permanent (e.g. reconnect after restart); keep id
            temp_id.to_string()
        };

        let temp_dir = self.instance_dir(temp_id);
        let permanent_dir = self.instance_dir(&permanent_id);
        let outcome = match promotion::promote_data_dir(&temp_dir, &permanent_dir).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(temp_id, error = %e, "directory promotion failed");
                let snapshot = {
                    let mut linking = self.linking.lock().await;
                    if linking.owns(temp_id) {
                        linking.fail(LinkStatus::Error, "Failed to promote instance data");
                        Some(linking.snapshot())
                    } else {
                        None
                    }
                };
                if let Some(snapshot) = snapshot {
                    self.publish(FleetEvent::Broadcast(snapshot));
                }
                return;
            }
        };

        let linking_caller = {
            let linking = self.linking.lock().await;
            if linking.owns(temp_id) {
                linking.caller_id().map(|c| c.to_string())
            } else {
                None
            }
        };

        // Move the table row under the permanent id
        let (credentials, status_event) = {
            let mut instances = self.instances.lock().await;
            let mut instance = instances
                .remove(temp_id)
                .unwrap_or_else(|| WorkerInstance::new(&permanent_id, self.config.log_capacity));
            instance.instance_id = permanent_id.clone();
            instance.is_linking_instance = false;
            instance.phone_number = Some(phone_number.clone());
            if let Some(name) = &report.name {
                instance.display_name = Some(name.clone());
            }
            instance.set_status(InstanceStatus::Connected);
            let credentials = instance.credentials.clone();
            let event = self.status_update(&instance);
            instances.insert(permanent_id.clone(), instance);
            (credentials, event)
        };

        let config = InstanceConfig {
            phone_number: phone_number.clone(),
            display_name: report.name.clone(),
            credentials,
            owner_id: linking_caller.clone(),
            linked_at: Utc::now(),
        };
        // Persistence errors leave in-memory state authoritative
        if let Err(e) = config.write_to_dir(&permanent_dir).await {
            warn!(instance_id = %permanent_id, error = %e, "failed to write instance config");
        }

        if let Some(caller) = &linking_caller {
            self.identity.claim(caller, &permanent_id).await;
        }
        self.identity.rebind_instance(temp_id, &permanent_id).await;

        info!(
            from = temp_id,
            to = %permanent_id,
            outcome = ?outcome,
            "instance promoted"
        );
        if temp_id != permanent_id {
            self.publish(FleetEvent::Promoted {
                from: temp_id.to_string(),
                to: permanent_id.clone(),
            });
        }
        self.publish(status_event);

        let snapshot = {
            let mut linking = self.linking.lock().await;
            if linking.owns(temp_id) || linking.owns(&permanent_id) {
                linking.complete(&permanent_id, Some(&phone_number), report.name.as_deref());
                Some(linking.snapshot())
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            self.publish(FleetEvent::Broadcast(snapshot));
        }
    }

    /// Apply a QR scan payload from a worker.
    pub async fn apply_qr(&self, instance_id: &str, payload: &str) {
        {
            let mut instances = self.instances.lock().await;
            if let Some(instance) = instances.get_mut(instance_id) {
                instance.set_status(InstanceStatus::Qr);
            }
        }

        let snapshot = {
            let mut linking = self.linking.lock().await;
            if !linking.owns(instance_id) {
                debug!(instance_id, "qr payload from non-linking instance, ignoring");
                return;
            }
            linking.set_qr(payload);
            linking.snapshot()
        };
        self.publish(FleetEvent::Broadcast(snapshot));
    }

    /// A worker's control socket closed without any report. Converge the
    /// table to a disconnected view.
    pub async fn worker_disconnected(&self, instance_id: &str) {
        let event = {
            let mut instances = self.instances.lock().await;
            match instances.get_mut(instance_id) {
                Some(instance) if !matches!(instance.status, InstanceStatus::Exited(_)) => {
                    instance.set_status(InstanceStatus::Disconnected);
                    Some(self.status_update(instance))
                }
                _ => None,
            }
        };
        if let Some(event) = event {
            self.publish(event);
        }
    }

    async fn append_log(&self, instance_id: &str, line: &str) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(instance_id) {
            instance.logs.push(line);
        }
    }

    /// Handle an observed process exit.
    async fn handle_exit(&self, instance_id: &str, code: Option<i32>) {
        info!(instance_id, code = ?code, "worker exited");
        let event = {
            let mut instances = self.instances.lock().await;
            match instances.get_mut(instance_id) {
                Some(instance) => {
                    instance.handle = None;
                    instance.stop_timer_armed = false;
                    instance.set_status(InstanceStatus::Exited(code));
                    Some(self.status_update(instance))
                }
                None => None,
            }
        };
        if let Some(event) = event {
            self.publish(event);
        }

        let snapshot = {
            let mut linking = self.linking.lock().await;
            if linking.owns(instance_id) && !linking.status().is_terminal() {
                linking.fail(LinkStatus::LinkingFailed, "Linking worker exited");
                Some(linking.snapshot())
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            self.publish(FleetEvent::Broadcast(snapshot));
        }
    }
}

fn phone_from_instance_id(instance_id: &str) -> Option<String> {
    // Permanent ids look like "wa-<digits>-<token>"
    let mut parts = instance_id.splitn(3, '-');
    let _prefix = parts.next()?;
    let digits = parts.next()?;
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(digits.to_string())
    } else {
        None
    }
}

async fn dir_is_non_empty(dir: &std::path::Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}
