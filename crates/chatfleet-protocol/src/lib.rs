// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! # chatfleet-protocol
//!
//! Wire protocol for the chatfleet control plane. One TCP socket carries
//! every conversation the supervisor has: administrative clients issuing
//! commands and receiving pushed events, and worker processes streaming
//! session reports.
//!
//! ## Architecture
//!
//! The protocol is layered:
//!
//! ```text
//! +------------------------------------------+
//! |  Messages (AdminCommand, WorkerReport,   |
//! |  ServerEvent, WorkerDirective)           |
//! +------------------------------------------+
//! |  JSON serialization (serde_json)         |
//! +------------------------------------------+
//! |  Length-prefixed framing (4-byte BE)     |
//! +------------------------------------------+
//! |  TCP transport                           |
//! +------------------------------------------+
//! ```
//!
//! ## Connection classification
//!
//! The server does not authenticate peers; it classifies each
//! connection by the shape of its first message. A frame that parses as
//! an [`AdminCommand`] makes the connection an administrative peer; one
//! that parses as a [`WorkerReport`] makes it a worker peer. Anything
//! else closes the connection. See [`classify_first_message`].

pub mod client;
pub mod frame;
pub mod messages;

pub use client::ControlClient;
pub use frame::{Frame, FrameError, FramedStream, HEADER_SIZE, MAX_FRAME_SIZE, read_frame, write_frame};
pub use messages::{
    AdminCommand, InstanceSummary, PeerHello, ServerEvent, StatusReport, WorkerDirective,
    WorkerReport, WorkerStatus, classify_first_message,
};
