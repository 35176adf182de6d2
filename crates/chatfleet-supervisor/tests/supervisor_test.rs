// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the fleet supervisor using the mock spawner.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use chatfleet_protocol::{ServerEvent, StatusReport, WorkerStatus};
use chatfleet_supervisor::config::Config;
use chatfleet_supervisor::identity::IdentityRegistry;
use chatfleet_supervisor::instance::Credentials;
use chatfleet_supervisor::spawner::{MockSpawner, WorkerSpawner};
use chatfleet_supervisor::supervisor::{
    DeleteOutcome, FleetEvent, FleetSupervisor, StopOutcome,
};

fn test_config(data_dir: &Path) -> Config {
    Config {
        control_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        worker_addr: "127.0.0.1:0".to_string(),
        data_dir: data_dir.to_path_buf(),
        worker_cmd: "chatfleet-worker".to_string(),
        stop_grace: Duration::from_millis(100),
        restart_settle: Duration::from_millis(50),
        delete_grace: Duration::from_millis(500),
        log_capacity: 5,
    }
}

struct Harness {
    supervisor: Arc<FleetSupervisor>,
    spawner: Arc<MockSpawner>,
    events: broadcast::Receiver<FleetEvent>,
    _data_dir: tempfile::TempDir,
}

async fn setup() -> Harness {
    setup_with(MockSpawner::new).await
}

async fn setup_stubborn() -> Harness {
    setup_with(MockSpawner::stubborn).await
}

async fn setup_with(
    make: impl FnOnce(mpsc::UnboundedSender<chatfleet_supervisor::spawner::ChildEvent>) -> MockSpawner,
) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    let config = test_config(data_dir.path());
    let identity = IdentityRegistry::load(&config.identity_registry_path()).await;

    let (tx, rx) = mpsc::unbounded_channel();
    let spawner = Arc::new(make(tx));
    let supervisor = FleetSupervisor::new(config, spawner.clone() as Arc<dyn WorkerSpawner>, identity);
    supervisor.clone().spawn_event_loop(rx);
    let events = supervisor.subscribe();

    Harness {
        supervisor,
        spawner,
        events,
        _data_dir: data_dir,
    }
}

async fn next_broadcast(events: &mut broadcast::Receiver<FleetEvent>) -> ServerEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for fleet event")
            .expect("event channel closed");
        if let FleetEvent::Broadcast(event) = event {
            return event;
        }
    }
}

fn connected_report(phone: &str, name: &str) -> StatusReport {
    StatusReport {
        status: WorkerStatus::Connected,
        message: "session open".to_string(),
        phone_number: Some(phone.to_string()),
        name: Some(name.to_string()),
    }
}

#[tokio::test]
async fn test_double_launch_spawns_once() {
    let h = setup().await;

    let first = h
        .supervisor
        .launch("w1", None, false, Credentials::default())
        .await
        .unwrap();
    let second = h
        .supervisor
        .launch("w1", None, false, Credentials::default())
        .await
        .unwrap();

    assert_eq!(first.handle_id, second.handle_id);
    assert_eq!(h.spawner.spawn_count(), 1);
}

#[tokio::test]
async fn test_stop_unknown_instance_is_not_found() {
    let h = setup().await;

    assert_eq!(h.supervisor.stop("nope").await, StopOutcome::NotFound);
}

#[tokio::test]
async fn test_double_stop_arms_one_timer() {
    let h = setup_stubborn().await;

    h.supervisor
        .launch("w1", None, false, Credentials::default())
        .await
        .unwrap();

    assert_eq!(h.supervisor.stop("w1").await, StopOutcome::Stopping);
    assert_eq!(h.supervisor.stop("w1").await, StopOutcome::AlreadyStopping);

    // The stubborn child ignores SIGTERM; only the single armed timer
    // may kill it
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.spawner.terminate_count(), 1);
    assert_eq!(h.spawner.kill_count(), 1);
}

#[tokio::test]
async fn test_graceful_stop_never_force_kills() {
    let h = setup().await;

    h.supervisor
        .launch("w1", None, false, Credentials::default())
        .await
        .unwrap();
    h.supervisor.stop("w1").await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.spawner.kill_count(), 0);
}

#[tokio::test]
async fn test_linking_scenario_promotes_to_permanent_id() {
    let mut h = setup().await;

    let temp_id = h.supervisor.request_qr(Some("caller-1")).await.unwrap();
    assert!(temp_id.starts_with("linking-"));

    h.supervisor
        .apply_worker_status(
            &temp_id,
            &StatusReport {
                status: WorkerStatus::Connecting,
                message: "dialing".to_string(),
                phone_number: None,
                name: None,
            },
        )
        .await;
    h.supervisor.apply_qr(&temp_id, "ABC").await;
    h.supervisor
        .apply_worker_status(&temp_id, &connected_report("19995550123", "Ann"))
        .await;

    let instances = h.supervisor.list_instances().await;
    assert_eq!(instances.len(), 1);
    let instance = &instances[0];
    assert!(instance.instance_id.starts_with("wa-19995550123-"));
    assert_eq!(instance.status, "connected");
    assert!(!instance.is_linking_instance);
    assert!(!instances.iter().any(|i| i.instance_id == temp_id));

    // Config file lives under the permanent directory
    let config_path = h
        ._data_dir
        .path()
        .join("instances")
        .join(&instance.instance_id)
        .join("instance.json");
    let content = tokio::fs::read_to_string(&config_path).await.unwrap();
    assert!(content.contains("19995550123"));

    // The caller's registry entry follows the permanent id
    assert_eq!(
        h.supervisor.identity().lookup("caller-1").await.as_deref(),
        Some(instance.instance_id.as_str())
    );

    // The final linking broadcast reports connected without a QR payload
    let mut last_status = None;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(100), h.events.recv()).await
    {
        if let FleetEvent::Broadcast(ServerEvent::Status { status, qr, .. }) = event {
            last_status = Some((status, qr));
        }
    }
    let (status, qr) = last_status.expect("no linking broadcast seen");
    assert_eq!(status, "connected");
    assert!(qr.is_none());
}

#[tokio::test]
async fn test_qr_reentry_broadcasts_latest_payload() {
    let mut h = setup().await;

    let temp_id = h.supervisor.request_qr(None).await.unwrap();
    h.supervisor.apply_qr(&temp_id, "P1").await;
    h.supervisor.apply_qr(&temp_id, "P2").await;

    let mut payloads = Vec::new();
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(100), h.events.recv()).await
    {
        if let FleetEvent::Broadcast(ServerEvent::Status { qr: Some(qr), .. }) = event {
            payloads.push(qr);
        }
    }

    assert_eq!(payloads, vec!["P1", "P2"]);
}

#[tokio::test]
async fn test_spawn_failure_fails_linking_attempt() {
    let mut h = setup_with(|tx| {
        let mut spawner = MockSpawner::new(tx);
        spawner.fail_spawn = true;
        spawner
    })
    .await;

    assert!(h.supervisor.request_qr(None).await.is_err());

    // The failure surfaces as a terminal linking error broadcast
    let mut last_status = None;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(100), h.events.recv()).await
    {
        if let FleetEvent::Broadcast(ServerEvent::Status { status, .. }) = event {
            last_status = Some(status);
        }
    }
    assert_eq!(last_status.as_deref(), Some("error"));
}

#[tokio::test]
async fn test_connected_without_phone_fails_linking() {
    let mut h = setup().await;

    let temp_id = h.supervisor.request_qr(None).await.unwrap();
    h.supervisor
        .apply_worker_status(
            &temp_id,
            &StatusReport {
                status: WorkerStatus::Connected,
                message: "session open".to_string(),
                phone_number: None,
                name: None,
            },
        )
        .await;

    // No permanent id can be derived, so no promoted instance appears
    let instances = h.supervisor.list_instances().await;
    assert!(instances.iter().all(|i| !i.instance_id.starts_with("wa-")));

    let mut last_status = None;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(100), h.events.recv()).await
    {
        if let FleetEvent::Broadcast(ServerEvent::Status { status, .. }) = event {
            last_status = Some(status);
        }
    }
    assert_eq!(last_status.as_deref(), Some("error"));
}

#[tokio::test]
async fn test_second_request_qr_stops_previous_worker() {
    let h = setup_stubborn().await;

    let first = h.supervisor.request_qr(None).await.unwrap();
    let second = h.supervisor.request_qr(None).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(h.spawner.spawn_count(), 2);
    assert_eq!(h.spawner.terminate_count(), 1);
}

#[tokio::test]
async fn test_promotion_idempotent_for_permanent_id() {
    let h = setup().await;

    let id = "wa-19995550123-abc12345";
    h.supervisor
        .launch(id, Some("19995550123"), false, Credentials::default())
        .await
        .unwrap();
    h.supervisor
        .apply_worker_status(id, &connected_report("19995550123", "Ann"))
        .await;

    let instances = h.supervisor.list_instances().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, id);
    assert_eq!(instances[0].status, "connected");

    let config_path = h
        ._data_dir
        .path()
        .join("instances")
        .join(id)
        .join("instance.json");
    assert!(config_path.exists());
}

#[tokio::test]
async fn test_delete_untracked_removes_directory() {
    let mut h = setup().await;

    let ghost_dir = h._data_dir.path().join("instances/ghost");
    tokio::fs::create_dir_all(&ghost_dir).await.unwrap();
    tokio::fs::write(ghost_dir.join("leftover.txt"), "x")
        .await
        .unwrap();

    let outcome = h.supervisor.delete("ghost").await;

    assert_eq!(outcome, DeleteOutcome::DeletedUntracked);
    assert!(!ghost_dir.exists());

    loop {
        match next_broadcast(&mut h.events).await {
            ServerEvent::InstanceDeleted { instance_id } => {
                assert_eq!(instance_id, "ghost");
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_delete_tracked_instance() {
    let h = setup().await;

    h.supervisor
        .launch("w1", None, false, Credentials::default())
        .await
        .unwrap();
    h.supervisor.identity().claim("caller-1", "w1").await;

    let outcome = h.supervisor.delete("w1").await;

    assert_eq!(outcome, DeleteOutcome::Deleted);
    assert!(h.supervisor.list_instances().await.is_empty());
    assert!(h.supervisor.identity().lookup("caller-1").await.is_none());
}

#[tokio::test]
async fn test_worker_disconnect_converges_to_disconnected() {
    let h = setup().await;

    h.supervisor
        .launch("w1", None, false, Credentials::default())
        .await
        .unwrap();
    h.supervisor.worker_disconnected("w1").await;

    let instances = h.supervisor.list_instances().await;
    assert_eq!(instances[0].status, "disconnected");
}

#[tokio::test]
async fn test_linking_worker_exit_fails_the_attempt() {
    let mut h = setup().await;

    let temp_id = h.supervisor.request_qr(None).await.unwrap();
    h.spawner.exit_instance(&temp_id, Some(1)).await;

    let mut saw_failure = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(200), h.events.recv()).await
    {
        if let FleetEvent::Broadcast(ServerEvent::Status { status, .. }) = event
            && status == "linking_failed"
        {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn test_restart_relaunches_with_same_id() {
    let h = setup().await;

    h.supervisor
        .launch("w1", Some("19995550123"), false, Credentials::default())
        .await
        .unwrap();
    h.supervisor.restart("w1").await.unwrap();

    assert_eq!(h.spawner.spawn_count(), 2);
    let instances = h.supervisor.list_instances().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, "w1");
    assert_eq!(instances[0].phone_number.as_deref(), Some("19995550123"));
}

#[tokio::test]
async fn test_logs_flow_through_ring_buffer() {
    let h = setup().await;

    h.supervisor
        .launch("w1", None, false, Credentials::default())
        .await
        .unwrap();
    for i in 0..7 {
        h.spawner.emit_line("w1", &format!("line {i}"));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Capacity is 5, so the two oldest lines fell off
    let logs = h.supervisor.logs("w1").await.unwrap();
    assert_eq!(logs.len(), 5);
    assert_eq!(logs.first().map(String::as_str), Some("line 2"));
    assert_eq!(logs.last().map(String::as_str), Some("line 6"));
}

#[tokio::test]
async fn test_recover_on_boot() {
    let h = setup().await;
    let instances_root = h._data_dir.path().join("instances");

    // Stale linking directory: skipped entirely
    tokio::fs::create_dir_all(instances_root.join("linking-stale01/session"))
        .await
        .unwrap();

    // Linked instance with credentials: relaunched
    let linked = instances_root.join("wa-19995550123-abc12345");
    tokio::fs::create_dir_all(linked.join("session")).await.unwrap();
    tokio::fs::write(linked.join("session/creds.json"), "{}")
        .await
        .unwrap();
    tokio::fs::write(
        linked.join("instance.json"),
        serde_json::json!({
            "phoneNumber": "19995550123",
            "displayName": "Ann",
            "linkedAt": "2025-06-01T00:00:00Z"
        })
        .to_string(),
    )
    .await
    .unwrap();

    // Directory with an empty session: registered stopped, not launched
    tokio::fs::create_dir_all(instances_root.join("wa-19995550999-def67890/session"))
        .await
        .unwrap();

    h.supervisor.recover_on_boot().await.unwrap();

    assert_eq!(h.spawner.spawn_count(), 1);
    let instances = h.supervisor.list_instances().await;
    assert_eq!(instances.len(), 2);

    let linked = instances
        .iter()
        .find(|i| i.instance_id == "wa-19995550123-abc12345")
        .unwrap();
    assert_eq!(linked.status, "starting");
    assert_eq!(linked.phone_number.as_deref(), Some("19995550123"));
    assert_eq!(linked.name.as_deref(), Some("Ann"));

    let unlinked = instances
        .iter()
        .find(|i| i.instance_id == "wa-19995550999-def67890")
        .unwrap();
    assert_eq!(unlinked.status, "disconnected");
    // Phone derived from the directory name, no config file present
    assert_eq!(unlinked.phone_number.as_deref(), Some("19995550999"));
}
