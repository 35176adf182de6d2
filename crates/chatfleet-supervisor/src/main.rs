// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chatfleet Supervisor - Fleet Management Server
//!
//! A TCP control-plane server responsible for:
//! - Worker process lifecycle (launch, stop, restart, delete, recovery)
//! - Account linking (QR handshake, identity promotion)
//! - Relaying ad-hoc commands between admin clients and workers

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use chatfleet_supervisor::config::Config;
use chatfleet_supervisor::identity::IdentityRegistry;
use chatfleet_supervisor::server::ControlServer;
use chatfleet_supervisor::spawner::{ProcessSpawner, WorkerSpawner};
use chatfleet_supervisor::supervisor::FleetSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatfleet_supervisor=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        control_addr = %config.control_addr,
        data_dir = %config.data_dir.display(),
        worker_cmd = %config.worker_cmd,
        "Starting Chatfleet Supervisor"
    );

    // Identity registry is loaded before anything can mutate it
    let identity = IdentityRegistry::load(&config.identity_registry_path()).await;

    // Child output and exits flow through one channel into the supervisor
    let (child_events_tx, child_events_rx) = mpsc::unbounded_channel();
    let spawner: Arc<dyn WorkerSpawner> =
        Arc::new(ProcessSpawner::new(&config.worker_cmd, child_events_tx));
    info!(spawner_type = spawner.spawner_type(), "Spawner initialized");

    let control_addr = config.control_addr;
    let supervisor = FleetSupervisor::new(config, spawner, identity);
    supervisor.clone().spawn_event_loop(child_events_rx);

    // Resume previously linked instances
    supervisor.recover_on_boot().await?;
    info!("Boot recovery complete");

    // Start the control server
    let listener = TcpListener::bind(control_addr).await?;
    let server = ControlServer::new(supervisor);
    tokio::spawn(async move {
        if let Err(e) = server.run(listener).await {
            warn!("Control server stopped: {}", e);
        }
    });

    info!(addr = %control_addr, "Control server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    info!("Chatfleet Supervisor shut down");

    Ok(())
}
