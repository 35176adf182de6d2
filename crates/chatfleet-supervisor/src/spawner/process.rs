// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process spawner.
//!
//! Launches worker executables with piped output, delivers their
//! stdout/stderr lines and exit as [`ChildEvent`]s, and signals them
//! with SIGTERM/SIGKILL.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::traits::*;

/// Spawner backed by real OS processes.
pub struct ProcessSpawner {
    worker_cmd: String,
    events: UnboundedSender<ChildEvent>,
    running: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl ProcessSpawner {
    /// Create a spawner for the given worker executable. Child output
    /// and exits are delivered on `events`.
    pub fn new(worker_cmd: &str, events: UnboundedSender<ChildEvent>) -> Self {
        Self {
            worker_cmd: worker_cmd.to_string(),
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pump_lines<R>(&self, reader: R, instance_id: String)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                // Receiver gone means the supervisor is shutting down
                if events
                    .send(ChildEvent::Output {
                        instance_id: instance_id.clone(),
                        line,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    fn spawner_type(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, options: &SpawnOptions) -> Result<WorkerHandle> {
        tokio::fs::create_dir_all(&options.instance_dir).await?;

        let mut command = Command::new(&self.worker_cmd);
        command
            .env("CHATFLEET_INSTANCE_ID", &options.instance_id)
            .env("CHATFLEET_INSTANCE_DIR", &options.instance_dir)
            .env("CHATFLEET_CONTROL_ADDR", &options.control_addr)
            .env("CHATFLEET_API_USER", &options.credentials.api_user)
            .env("CHATFLEET_API_PASS", &options.credentials.api_pass)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        if let Some(owner) = &options.credentials.owner_number {
            command.env("CHATFLEET_OWNER_NUMBER", owner);
        }
        if let Some(phone) = &options.phone_number {
            command.env("CHATFLEET_PHONE_NUMBER", phone);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SpawnError::BinaryNotFound(self.worker_cmd.clone())
            } else {
                SpawnError::StartFailed(e.to_string())
            }
        })?;

        let pid = child.id();
        let handle_id = format!("proc_{}", uuid::Uuid::new_v4().simple());
        info!(
            instance_id = %options.instance_id,
            pid = ?pid,
            "worker process spawned"
        );

        if let Some(stdout) = child.stdout.take() {
            self.pump_lines(stdout, options.instance_id.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump_lines(stderr, options.instance_id.clone());
        }

        let alive = Arc::new(AtomicBool::new(true));
        {
            let mut running = self.running.lock().await;
            running.insert(handle_id.clone(), alive.clone());
        }

        // Waiter task owns the child and reports its exit
        let events = self.events.clone();
        let running = self.running.clone();
        let instance_id = options.instance_id.clone();
        let waiter_handle_id = handle_id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "wait on worker failed");
                    None
                }
            };

            alive.store(false, Ordering::SeqCst);
            {
                let mut running = running.lock().await;
                running.remove(&waiter_handle_id);
            }

            debug!(instance_id = %instance_id, code = ?code, "worker process exited");
            let _ = events.send(ChildEvent::Exited { instance_id, code });
        });

        Ok(WorkerHandle {
            handle_id,
            instance_id: options.instance_id.clone(),
            pid,
            started_at: Utc::now(),
        })
    }

    async fn is_running(&self, handle: &WorkerHandle) -> bool {
        let running = self.running.lock().await;
        running
            .get(&handle.handle_id)
            .map(|alive| alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<()> {
        send_signal(handle, Signal::SIGTERM)
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<()> {
        send_signal(handle, Signal::SIGKILL)
    }
}

fn send_signal(handle: &WorkerHandle, sig: Signal) -> Result<()> {
    let Some(pid) = handle.pid else {
        return Err(SpawnError::Other(format!(
            "no pid for instance {}",
            handle.instance_id
        )));
    };

    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        // Already gone counts as delivered
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(SpawnError::SignalFailed {
            pid,
            message: e.to_string(),
        }),
    }
}
