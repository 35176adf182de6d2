// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock spawner for testing.
//!
//! Simulates worker processes without spawning anything. Tests drive
//! the simulated children through [`MockSpawner::emit_line`] and
//! [`MockSpawner::exit_instance`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use super::traits::*;

#[derive(Debug)]
struct MockChild {
    running: Arc<AtomicBool>,
}

/// Mock spawner for testing.
pub struct MockSpawner {
    events: UnboundedSender<ChildEvent>,
    children: Arc<Mutex<HashMap<String, MockChild>>>,
    spawn_count: AtomicUsize,
    terminate_count: AtomicUsize,
    kill_count: AtomicUsize,
    /// When false, `terminate` is ignored so the child only dies to a
    /// force-kill. Used to exercise the stop grace timer.
    pub honor_terminate: bool,
    /// When true, `spawn` fails with a start error.
    pub fail_spawn: bool,
}

impl MockSpawner {
    /// Create a mock spawner delivering child events on `events`.
    pub fn new(events: UnboundedSender<ChildEvent>) -> Self {
        Self {
            events,
            children: Arc::new(Mutex::new(HashMap::new())),
            spawn_count: AtomicUsize::new(0),
            terminate_count: AtomicUsize::new(0),
            kill_count: AtomicUsize::new(0),
            honor_terminate: true,
            fail_spawn: false,
        }
    }

    /// Create a mock spawner whose children ignore graceful termination.
    pub fn stubborn(events: UnboundedSender<ChildEvent>) -> Self {
        Self {
            honor_terminate: false,
            ..Self::new(events)
        }
    }

    /// How many times `spawn` succeeded.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// How many times `terminate` was called.
    pub fn terminate_count(&self) -> usize {
        self.terminate_count.load(Ordering::SeqCst)
    }

    /// How many times `kill` was called.
    pub fn kill_count(&self) -> usize {
        self.kill_count.load(Ordering::SeqCst)
    }

    /// Simulate one line of worker output.
    pub fn emit_line(&self, instance_id: &str, line: &str) {
        let _ = self.events.send(ChildEvent::Output {
            instance_id: instance_id.to_string(),
            line: line.to_string(),
        });
    }

    /// Simulate the child exiting with the given code.
    pub async fn exit_instance(&self, instance_id: &str, code: Option<i32>) {
        {
            let mut children = self.children.lock().await;
            if let Some(child) = children.remove(instance_id) {
                child.running.store(false, Ordering::SeqCst);
            }
        }
        let _ = self.events.send(ChildEvent::Exited {
            instance_id: instance_id.to_string(),
            code,
        });
    }
}

#[async_trait]
impl WorkerSpawner for MockSpawner {
    fn spawner_type(&self) -> &'static str {
        "mock"
    }

    async fn spawn(&self, options: &SpawnOptions) -> Result<WorkerHandle> {
        if self.fail_spawn {
            return Err(SpawnError::StartFailed("mock spawn failure".to_string()));
        }

        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        let running = Arc::new(AtomicBool::new(true));
        {
            let mut children = self.children.lock().await;
            children.insert(
                options.instance_id.clone(),
                MockChild {
                    running: running.clone(),
                },
            );
        }

        Ok(WorkerHandle {
            handle_id: format!("mock_{}", uuid::Uuid::new_v4().simple()),
            instance_id: options.instance_id.clone(),
            pid: None,
            started_at: Utc::now(),
        })
    }

    async fn is_running(&self, handle: &WorkerHandle) -> bool {
        let children = self.children.lock().await;
        children
            .get(&handle.instance_id)
            .map(|c| c.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<()> {
        self.terminate_count.fetch_add(1, Ordering::SeqCst);
        if self.honor_terminate {
            self.exit_instance(&handle.instance_id, Some(0)).await;
        }
        Ok(())
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<()> {
        self.kill_count.fetch_add(1, Ordering::SeqCst);
        self.exit_instance(&handle.instance_id, None).await;
        Ok(())
    }
}
