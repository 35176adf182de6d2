// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The singleton account-linking state machine.
//!
//! At most one linking attempt exists at a time. States:
//!
//! ```text
//! disconnected -> linking_in_progress -> qr -> connected
//!                        |               |  \-> error / linking_failed
//!                        |               |       / disconnected_logout
//!                        \---------------/
//! ```
//!
//! `qr` is re-entrant: a fresh scan payload replaces the previous one.
//! From any terminal state a new attempt may begin (last request wins).

use chatfleet_protocol::ServerEvent;

/// Linking-session status, broadcast verbatim to administrative peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No attempt in progress (initial and post-reset state).
    Disconnected,
    /// A temporary worker is launched, awaiting its first report.
    LinkingInProgress,
    /// A scan payload is available.
    Qr,
    /// Terminal success; promotion has run.
    Connected,
    /// Terminal failure (worker error or promotion failure).
    Error,
    /// Terminal failure (worker exited or lost its session).
    LinkingFailed,
    /// Terminal failure (account logged out during linking).
    DisconnectedLogout,
}

impl LinkStatus {
    /// Wire representation used in status broadcasts.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::LinkingInProgress => "linking_in_progress",
            Self::Qr => "qr",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::LinkingFailed => "linking_failed",
            Self::DisconnectedLogout => "disconnected_logout",
        }
    }

    /// Terminal states allow a fresh attempt without stopping anything.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::LinkingInProgress | Self::Qr)
    }
}

/// The process-wide linking session.
#[derive(Debug)]
pub struct LinkingSession {
    status: LinkStatus,
    qr_payload: Option<String>,
    message: String,
    instance_id: Option<String>,
    caller_id: Option<String>,
    phone_number: Option<String>,
    display_name: Option<String>,
}

impl Default for LinkingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkingSession {
    /// Create a session in the initial `disconnected` state.
    pub fn new() -> Self {
        Self {
            status: LinkStatus::Disconnected,
            qr_payload: None,
            message: String::new(),
            instance_id: None,
            caller_id: None,
            phone_number: None,
            display_name: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> LinkStatus {
        self.status
    }

    /// The temporary worker this attempt belongs to, if any.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// The caller that requested this attempt, if it identified itself.
    pub fn caller_id(&self) -> Option<&str> {
        self.caller_id.as_deref()
    }

    /// Whether the given instance is the one this attempt tracks.
    pub fn owns(&self, instance_id: &str) -> bool {
        self.instance_id.as_deref() == Some(instance_id)
    }

    /// Begin a fresh attempt for a newly launched temporary worker.
    pub fn begin(&mut self, instance_id: &str, caller_id: Option<&str>) {
        self.status = LinkStatus::LinkingInProgress;
        self.qr_payload = None;
        self.message = "Starting account linking".to_string();
        self.instance_id = Some(instance_id.to_string());
        self.caller_id = caller_id.map(|c| c.to_string());
        self.phone_number = None;
        self.display_name = None;
    }

    /// Record a scan payload. Replaces any previous payload.
    pub fn set_qr(&mut self, payload: &str) {
        self.status = LinkStatus::Qr;
        self.qr_payload = Some(payload.to_string());
        self.message = "Scan the QR code to link the account".to_string();
    }

    /// Intermediate progress without a payload (e.g. worker connecting).
    pub fn progress(&mut self, message: &str) {
        if self.status == LinkStatus::Qr {
            return;
        }
        self.status = LinkStatus::LinkingInProgress;
        self.qr_payload = None;
        self.message = message.to_string();
    }

    /// Terminal success after promotion ran. The session now points at
    /// the permanent id so the final broadcast names it.
    pub fn complete(&mut self, permanent_id: &str, phone_number: Option<&str>, name: Option<&str>) {
        self.status = LinkStatus::Connected;
        self.qr_payload = None;
        self.message = "Account linked".to_string();
        self.instance_id = Some(permanent_id.to_string());
        self.phone_number = phone_number.map(|p| p.to_string());
        self.display_name = name.map(|n| n.to_string());
    }

    /// Terminal failure.
    pub fn fail(&mut self, status: LinkStatus, message: &str) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.qr_payload = None;
        self.message = message.to_string();
    }

    /// Reset to the initial state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current state as a broadcastable event.
    pub fn snapshot(&self) -> ServerEvent {
        ServerEvent::Status {
            status: self.status.as_wire().to_string(),
            message: self.message.clone(),
            qr: self.qr_payload.clone(),
            instance_id: self.instance_id.clone(),
            phone_number: self.phone_number.clone(),
            name: self.display_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qr_of(event: &ServerEvent) -> Option<String> {
        match event {
            ServerEvent::Status { qr, .. } => qr.clone(),
            _ => panic!("expected status event"),
        }
    }

    #[test]
    fn test_qr_payload_only_in_qr_state() {
        let mut session = LinkingSession::new();
        assert!(qr_of(&session.snapshot()).is_none());

        session.begin("linking-abc12345", None);
        assert!(qr_of(&session.snapshot()).is_none());

        session.set_qr("PAYLOAD");
        assert_eq!(qr_of(&session.snapshot()).as_deref(), Some("PAYLOAD"));

        session.fail(LinkStatus::Error, "worker crashed");
        assert!(qr_of(&session.snapshot()).is_none());
    }

    #[test]
    fn test_qr_reentry_replaces_payload() {
        let mut session = LinkingSession::new();
        session.begin("linking-abc12345", None);
        session.set_qr("P1");
        session.set_qr("P2");

        assert_eq!(qr_of(&session.snapshot()).as_deref(), Some("P2"));
    }

    #[test]
    fn test_complete_points_at_permanent_id() {
        let mut session = LinkingSession::new();
        session.begin("linking-abc12345", Some("caller-1"));
        session.set_qr("P1");
        session.complete("wa-19995550123-abc12345", Some("19995550123"), Some("Ann"));

        assert_eq!(session.status(), LinkStatus::Connected);
        assert_eq!(session.instance_id(), Some("wa-19995550123-abc12345"));
        assert!(qr_of(&session.snapshot()).is_none());
    }

    #[test]
    fn test_progress_does_not_clobber_qr() {
        let mut session = LinkingSession::new();
        session.begin("linking-abc12345", None);
        session.set_qr("P1");
        session.progress("still connecting");

        assert_eq!(session.status(), LinkStatus::Qr);
        assert_eq!(qr_of(&session.snapshot()).as_deref(), Some("P1"));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(LinkStatus::Disconnected.is_terminal());
        assert!(LinkStatus::Connected.is_terminal());
        assert!(LinkStatus::LinkingFailed.is_terminal());
        assert!(!LinkStatus::Qr.is_terminal());
        assert!(!LinkStatus::LinkingInProgress.is_terminal());
    }
}
