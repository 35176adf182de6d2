// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-side handle for the control socket.
//!
//! Used by workers to report back to the supervisor and by
//! administrative tools (and tests) to drive it. The handle wraps one
//! persistent connection; the server classifies it by the first message
//! it sends.

use tokio::net::TcpStream;
use tracing::debug;

use crate::frame::{FrameError, FramedStream};
use crate::messages::{AdminCommand, ServerEvent, WorkerDirective, WorkerReport};

/// A persistent connection to the control-plane server.
pub struct ControlClient {
    stream: FramedStream<TcpStream>,
}

impl ControlClient {
    /// Connect to the control server.
    pub async fn connect(addr: &str) -> Result<Self, FrameError> {
        let stream = TcpStream::connect(addr).await?;
        debug!(addr, "connected to control server");
        Ok(Self {
            stream: FramedStream::new(stream),
        })
    }

    /// Send an administrative command.
    ///
    /// If this is the connection's first message, the server classifies
    /// the connection as an administrative peer.
    pub async fn send_command(&mut self, cmd: &AdminCommand) -> Result<(), FrameError> {
        self.stream.write_json(cmd).await
    }

    /// Send a worker report.
    ///
    /// If this is the connection's first message, the server classifies
    /// the connection as a worker peer.
    pub async fn send_report(&mut self, report: &WorkerReport) -> Result<(), FrameError> {
        self.stream.write_json(report).await
    }

    /// Receive the next server event (administrative peers).
    pub async fn recv_event(&mut self) -> Result<ServerEvent, FrameError> {
        self.stream.read_json().await
    }

    /// Receive the next directive from the server (worker peers).
    pub async fn recv_directive(&mut self) -> Result<WorkerDirective, FrameError> {
        self.stream.read_json().await
    }

    /// Receive the next message as raw JSON, without assuming a shape.
    pub async fn recv_value(&mut self) -> Result<serde_json::Value, FrameError> {
        self.stream.read_json().await
    }
}
