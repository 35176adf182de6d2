// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chatfleet Supervisor - Messaging Worker Fleet Management
//!
//! This crate supervises a fleet of long-lived messaging-session worker
//! processes, each bound to one external account. It launches, tracks,
//! restarts, and retires workers, and serves the control-plane socket
//! that administrative clients and workers both connect to.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Administrative Clients                      │
//! │                  (dashboard, operator tooling)                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                chatfleet-supervisor (This Crate)                │
//! │                          Port 7600                              │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────┐  ┌────────────┐  │
//! │  │  Control   │  │   Fleet    │  │ Identity │  │  Linking   │  │
//! │  │  Server    │  │ Supervisor │  │ Registry │  │  Session   │  │
//! │  └────────────┘  └────────────┘  └──────────┘  └────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!          ▲                │ Spawn / signal            │
//!          │ status/qr/     ▼                           ▼
//!          │ reply   ┌──────────────────┐     ┌──────────────────┐
//!          └─────────│ Worker Processes │     │    Data dir      │
//!                    │ (one per account)│     │ (instance.json,  │
//!                    └──────────────────┘     │ identity registry│
//!                                             │ session creds)   │
//!                                             └──────────────────┘
//! ```
//!
//! # Control Socket
//!
//! One TCP socket serves both peer kinds; the first message's shape
//! classifies the connection (see `chatfleet-protocol`).
//!
//! ## Administrative Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `requestQr` | Start a fresh account-linking attempt (last request wins) |
//! | `manualRelink` | Point a caller's registry entry at an instance |
//! | `listInstances` | Targeted snapshot of every tracked instance |
//! | `startInstance` | Start a linked, stopped instance |
//! | `stopInstance` | Graceful stop with a force-kill grace timer |
//! | `restartInstance` | Stop, settle, relaunch under the same id |
//! | `deleteInstance` | Stop and remove on-disk instance data |
//! | `getLogs` | Targeted snapshot of the instance's log ring buffer |
//! | `relayCommand` | Fire-and-forget sub-command to a worker socket |
//!
//! ## Worker Reports
//!
//! | Report | Description |
//! |--------|-------------|
//! | `status` | Session lifecycle transition (drives promotion) |
//! | `qr` | Fresh scan payload for the linking session |
//! | `reply` | Response to a relayed sub-command, rebroadcast verbatim |
//!
//! # Linking Session State Machine
//!
//! ```text
//!     ┌──────────────┐   requestQr    ┌─────────────────────┐
//!     │ disconnected │───────────────►│ linking_in_progress │
//!     └──────────────┘                └──────────┬──────────┘
//!            ▲                                   │ qr report
//!            │                                   ▼
//!            │                            ┌───────────┐◄──┐
//!            │ reset                      │    qr     │───┘ new payload
//!            │                            └─────┬─────┘
//!            │                 connected        │        failure
//!            │            ┌─────────────────────┼──────────────────┐
//!            │            ▼                     ▼                  ▼
//!     ┌──────┴─────┐ ┌───────────┐   ┌────────────────┐  ┌─────────────────┐
//!     │ (any       │ │ connected │   │ error /        │  │ disconnected_   │
//!     │  terminal) │ │(promoted) │   │ linking_failed │  │ logout          │
//!     └────────────┘ └───────────┘   └────────────────┘  └─────────────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CHATFLEET_CONTROL_PORT` | No | `7600` | Control socket port |
//! | `CHATFLEET_WORKER_ADDR` | No | `127.0.0.1:<port>` | Address workers dial back |
//! | `DATA_DIR` | No | `.data` | Root data directory |
//! | `CHATFLEET_WORKER_CMD` | No | `chatfleet-worker` | Worker executable |
//! | `CHATFLEET_STOP_GRACE_SECS` | No | `10` | Force-kill grace period |
//! | `CHATFLEET_RESTART_SETTLE_MS` | No | `1500` | Restart settle delay |
//! | `CHATFLEET_DELETE_GRACE_SECS` | No | `5` | Delete exit-wait bound |
//! | `CHATFLEET_LOG_CAPACITY` | No | `200` | Log ring buffer capacity |
//!
//! # Modules
//!
//! - [`config`]: Supervisor configuration from environment variables
//! - [`error`]: Error types for supervisor operations
//! - [`identity`]: Durable caller-to-instance registry
//! - [`instance`]: Instance table rows and the per-instance config file
//! - [`linking`]: The singleton account-linking state machine
//! - [`promotion`]: Temporary-to-permanent identity promotion
//! - [`server`]: Control-plane socket server
//! - [`spawner`]: Worker process execution backends
//! - [`supervisor`]: Fleet lifecycle orchestration

#![deny(missing_docs)]

/// Supervisor configuration loaded from environment variables.
pub mod config;

/// Error types for supervisor operations.
pub mod error;

/// Durable caller-to-instance identity registry.
pub mod identity;

/// Instance table rows and the per-instance config file.
pub mod instance;

/// The singleton account-linking state machine.
pub mod linking;

/// Temporary-to-permanent identity promotion.
pub mod promotion;

/// Control-plane socket server.
pub mod server;

/// Worker process execution backends (native process, mock).
pub mod spawner;

/// Fleet lifecycle orchestration.
pub mod supervisor;

pub use config::Config;
pub use error::Error;
