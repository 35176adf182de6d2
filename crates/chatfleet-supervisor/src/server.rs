// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The control-plane server.
//!
//! One listening socket accepts two peer kinds. The first frame of a
//! connection decides which: an administrative command marks it an
//! admin peer, a worker report marks it a worker peer, anything else
//! closes it. The classification is held for the connection's lifetime.
//!
//! Each connection gets a writer task owning the write half; dropping
//! every sender for that task closes the socket. This is how
//! last-writer-wins worker rebinding evicts a stale connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use chatfleet_protocol::frame::{Frame, FrameError, read_frame, write_frame};
use chatfleet_protocol::{
    AdminCommand, PeerHello, ServerEvent, WorkerDirective, WorkerReport, classify_first_message,
};

use crate::error::Result;
use crate::supervisor::{FleetEvent, FleetSupervisor, StopOutcome};

type PeerSender = UnboundedSender<Frame>;

struct WorkerPeer {
    conn_id: u64,
    tx: PeerSender,
}

/// The control-plane server.
pub struct ControlServer {
    supervisor: Arc<FleetSupervisor>,
    admin_peers: Mutex<HashMap<u64, PeerSender>>,
    worker_peers: Mutex<HashMap<String, WorkerPeer>>,
    next_conn_id: AtomicU64,
}

impl ControlServer {
    /// Create a server over the given supervisor.
    pub fn new(supervisor: Arc<FleetSupervisor>) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            admin_peers: Mutex::new(HashMap::new()),
            worker_peers: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Accept connections until the listener fails. Call from a spawned
    /// task; also starts the fleet-event pump.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let pump = self.clone();
        tokio::spawn(async move { pump.pump_fleet_events().await });

        info!(addr = ?listener.local_addr().ok(), "control server listening");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!(%peer_addr, "connection accepted");
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream).await;
            });
        }
    }

    /// Forward supervisor events to peers: broadcasts fan out to every
    /// admin peer, promotions rebind worker sockets to the new id.
    async fn pump_fleet_events(self: Arc<Self>) {
        let mut events = self.supervisor.subscribe();
        loop {
            match events.recv().await {
                Ok(FleetEvent::Broadcast(event)) => match Frame::from_msg(&event) {
                    Ok(frame) => self.broadcast_to_admins(frame).await,
                    Err(e) => warn!(error = %e, "failed to encode broadcast"),
                },
                Ok(FleetEvent::Promoted { from, to }) => {
                    let mut workers = self.worker_peers.lock().await;
                    if let Some(peer) = workers.remove(&from) {
                        debug!(%from, %to, "rebinding worker socket to promoted id");
                        workers.insert(to, peer);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "fleet event pump lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn broadcast_to_admins(&self, frame: Frame) {
        let mut admins = self.admin_peers.lock().await;
        admins.retain(|_, tx| tx.send(frame.clone()).is_ok());
    }

    async fn handle_connection(self: Arc<Self>, stream: tokio::net::TcpStream) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (mut reader, writer) = stream.into_split();

        let first = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return,
            Err(e) => {
                debug!(conn_id, error = %e, "failed to read first frame");
                return;
            }
        };

        let tx = spawn_writer(writer);

        match classify_first_message(&first.payload) {
            PeerHello::Admin(command) => {
                self.serve_admin(conn_id, reader, tx, command).await;
            }
            PeerHello::Worker(report) => {
                self.serve_worker(conn_id, reader, tx, report).await;
            }
            PeerHello::Malformed => {
                warn!(conn_id, "unclassifiable first message, closing connection");
            }
        }
    }

    async fn serve_admin(
        &self,
        conn_id: u64,
        mut reader: OwnedReadHalf,
        tx: PeerSender,
        first: AdminCommand,
    ) {
        info!(conn_id, "admin peer connected");
        {
            let mut admins = self.admin_peers.lock().await;
            admins.insert(conn_id, tx.clone());
        }

        self.dispatch_admin(conn_id, &tx, first).await;

        loop {
            let command = match read_frame(&mut reader).await {
                Ok(frame) => match frame.decode::<AdminCommand>() {
                    Ok(command) => command,
                    Err(e) => {
                        debug!(conn_id, error = %e, "undecodable admin command, ignoring");
                        continue;
                    }
                },
                Err(FrameError::ConnectionClosed) => break,
                Err(e) => {
                    debug!(conn_id, error = %e, "admin read failed");
                    break;
                }
            };
            self.dispatch_admin(conn_id, &tx, command).await;
        }

        info!(conn_id, "admin peer disconnected");
        let mut admins = self.admin_peers.lock().await;
        admins.remove(&conn_id);
    }

    async fn dispatch_admin(&self, conn_id: u64, tx: &PeerSender, command: AdminCommand) {
        match command {
            AdminCommand::RequestQr { caller_id } => {
                if let Some(caller) = &caller_id {
                    self.supervisor.identity().touch(caller).await;
                }
                // Failure is broadcast as a linking error status
                let _ = self.supervisor.request_qr(caller_id.as_deref()).await;
            }
            AdminCommand::ManualRelink {
                caller_id,
                instance_id,
            } => {
                self.supervisor.manual_relink(&caller_id, &instance_id).await;
            }
            AdminCommand::ListInstances { caller_id } => {
                if let Some(caller) = &caller_id {
                    self.supervisor.identity().touch(caller).await;
                }
                let instances = self.supervisor.list_instances().await;
                self.send_to(tx, &ServerEvent::InstanceList { instances });
            }
            AdminCommand::StartInstance { instance_id } => {
                if let Err(e) = self.supervisor.start(&instance_id).await {
                    warn!(conn_id, instance_id, error = %e, "start failed");
                }
            }
            AdminCommand::StopInstance { instance_id } => {
                let outcome = self.supervisor.stop(&instance_id).await;
                if outcome == StopOutcome::NotFound {
                    debug!(conn_id, instance_id, "stop for unknown instance, ignoring");
                }
            }
            AdminCommand::RestartInstance { instance_id } => {
                if let Err(e) = self.supervisor.restart(&instance_id).await {
                    warn!(conn_id, instance_id, error = %e, "restart failed");
                }
            }
            AdminCommand::DeleteInstance { instance_id } => {
                let outcome = self.supervisor.delete(&instance_id).await;
                debug!(conn_id, instance_id, ?outcome, "delete handled");
            }
            AdminCommand::GetLogs { instance_id } => {
                match self.supervisor.logs(&instance_id).await {
                    Some(logs) => {
                        self.send_to(tx, &ServerEvent::InstanceLogs { instance_id, logs });
                    }
                    None => {
                        debug!(conn_id, instance_id, "logs for unknown instance, ignoring");
                    }
                }
            }
            AdminCommand::RelayCommand {
                instance_id,
                sub_command,
                target_args,
            } => {
                self.relay_to_worker(&instance_id, &sub_command, target_args)
                    .await;
            }
        }
    }

    /// Fire-and-forget relay: if no worker socket is bound for the id,
    /// the command is dropped.
    async fn relay_to_worker(
        &self,
        instance_id: &str,
        sub_command: &str,
        target_args: serde_json::Value,
    ) {
        let args = match target_args {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let directive = WorkerDirective::RelayedCommand {
            instance_id: instance_id.to_string(),
            sub_command: sub_command.to_string(),
            args,
        };

        let workers = self.worker_peers.lock().await;
        match workers.get(instance_id) {
            Some(peer) => {
                if let Ok(frame) = Frame::from_msg(&directive) {
                    let _ = peer.tx.send(frame);
                }
            }
            None => {
                debug!(instance_id, sub_command, "no worker socket bound, relay dropped");
            }
        }
    }

    async fn serve_worker(
        &self,
        conn_id: u64,
        mut reader: OwnedReadHalf,
        tx: PeerSender,
        first: WorkerReport,
    ) {
        let instance_id = match &first {
            WorkerReport::Status { instance_id, .. }
            | WorkerReport::Qr { instance_id, .. }
            | WorkerReport::Reply { instance_id, .. } => instance_id.clone(),
        };
        info!(conn_id, instance_id, "worker peer connected");

        // Last writer wins: dropping the stale sender closes its socket
        {
            let mut workers = self.worker_peers.lock().await;
            if let Some(stale) = workers.insert(instance_id.clone(), WorkerPeer { conn_id, tx }) {
                warn!(
                    instance_id,
                    stale_conn = stale.conn_id,
                    "duplicate worker binding, evicting stale socket"
                );
            }
        }

        self.dispatch_worker(first).await;

        loop {
            let report = match read_frame(&mut reader).await {
                Ok(frame) => match frame.decode::<WorkerReport>() {
                    Ok(report) => report,
                    Err(e) => {
                        debug!(conn_id, error = %e, "undecodable worker report, ignoring");
                        continue;
                    }
                },
                Err(FrameError::ConnectionClosed) => break,
                Err(e) => {
                    debug!(conn_id, error = %e, "worker read failed");
                    break;
                }
            };
            self.dispatch_worker(report).await;
        }

        // Unbind only what this connection still owns; the id may have
        // moved under promotion, so match by conn_id
        let owned = {
            let mut workers = self.worker_peers.lock().await;
            let owned: Vec<String> = workers
                .iter()
                .filter(|(_, peer)| peer.conn_id == conn_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &owned {
                workers.remove(id);
            }
            owned
        };

        for id in owned {
            info!(conn_id, instance_id = %id, "worker peer disconnected");
            self.supervisor.worker_disconnected(&id).await;
        }
    }

    async fn dispatch_worker(&self, report: WorkerReport) {
        match report {
            WorkerReport::Status { instance_id, data } => {
                self.supervisor.apply_worker_status(&instance_id, &data).await;
            }
            WorkerReport::Qr { instance_id, data } => {
                self.supervisor.apply_qr(&instance_id, &data).await;
            }
            WorkerReport::Reply { instance_id, data } => {
                // Rebroadcast verbatim; reply correlation is the admin
                // client's responsibility
                debug!(instance_id, "rebroadcasting worker reply");
                match Frame::from_msg(&data) {
                    Ok(frame) => self.broadcast_to_admins(frame).await,
                    Err(e) => warn!(instance_id, error = %e, "failed to encode reply"),
                }
            }
        }
    }

    fn send_to<M: serde::Serialize>(&self, tx: &PeerSender, msg: &M) {
        match Frame::from_msg(msg) {
            Ok(frame) => {
                let _ = tx.send(frame);
            }
            Err(e) => warn!(error = %e, "failed to encode targeted reply"),
        }
    }
}

fn spawn_writer(mut writer: OwnedWriteHalf) -> PeerSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "peer write failed, closing writer");
                break;
            }
        }
        // Dropping the write half sends FIN
    });
    tx
}
