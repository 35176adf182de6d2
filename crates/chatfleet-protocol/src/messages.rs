// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed control-plane messages.
//!
//! Every message is one JSON object, externally tagged on `"type"` with
//! camelCase fields. Three directions share the socket:
//! - administrative peer -> server ([`AdminCommand`])
//! - worker peer -> server ([`WorkerReport`])
//! - server -> administrative peer ([`ServerEvent`]) and
//!   server -> worker peer ([`WorkerDirective`])
//!
//! A connection is classified by the shape of its first message (see
//! [`classify_first_message`]) and keeps that classification for its
//! lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands an administrative client may send to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AdminCommand {
    /// Start a fresh account-linking attempt (last request wins).
    RequestQr {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_id: Option<String>,
    },
    /// Point a caller's identity-registry entry at an existing instance.
    ManualRelink {
        caller_id: String,
        instance_id: String,
    },
    /// List all tracked instances (targeted reply).
    ListInstances {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_id: Option<String>,
    },
    /// Start a previously linked, stopped instance.
    StartInstance { instance_id: String },
    /// Gracefully stop a running instance.
    StopInstance { instance_id: String },
    /// Stop and relaunch an instance under the same id.
    RestartInstance { instance_id: String },
    /// Stop an instance and remove its on-disk data.
    DeleteInstance { instance_id: String },
    /// Fetch the instance's log ring buffer (targeted reply).
    GetLogs { instance_id: String },
    /// Relay an ad-hoc sub-command to a worker (at-most-once, no reply
    /// correlation; the admin client matches replies out-of-band).
    RelayCommand {
        instance_id: String,
        sub_command: String,
        #[serde(default)]
        target_args: Value,
    },
}

/// High-level connection status a worker reports about its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Connecting,
    Qr,
    Connected,
    Disconnected,
    LoggedOut,
    Error,
    /// Forward-compatible catch-all for statuses this server predates.
    #[serde(other)]
    Unknown,
}

/// Payload of a worker `status` report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: WorkerStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Reports a worker process sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerReport {
    /// Session lifecycle transition.
    Status {
        instance_id: String,
        data: StatusReport,
    },
    /// A fresh QR scan payload (replaces any previous one).
    Qr { instance_id: String, data: String },
    /// Reply to a previously relayed sub-command, rebroadcast verbatim.
    Reply { instance_id: String, data: Value },
}

/// One row of an `instanceList` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub instance_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub is_linking_instance: bool,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Events the server sends to administrative peers (broadcast or targeted).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Linking-session update (broadcast).
    Status {
        status: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        qr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phone_number: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Per-instance status change (broadcast).
    InstanceStatusUpdate {
        instance_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phone_number: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Reply to `listInstances` (targeted).
    InstanceList { instances: Vec<InstanceSummary> },
    /// Reply to `getLogs` (targeted).
    InstanceLogs {
        instance_id: String,
        logs: Vec<String>,
    },
    /// An instance and its on-disk data are gone (broadcast).
    InstanceDeleted { instance_id: String },
}

/// Envelopes the server writes to worker peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerDirective {
    /// A relayed admin sub-command; `args` is flattened into the object.
    RelayedCommand {
        instance_id: String,
        sub_command: String,
        #[serde(flatten)]
        args: serde_json::Map<String, Value>,
    },
}

/// Result of classifying a connection's first message.
#[derive(Debug, Clone)]
pub enum PeerHello {
    /// First message parsed as an administrative command.
    Admin(AdminCommand),
    /// First message parsed as a worker report.
    Worker(WorkerReport),
    /// Neither shape matched; the connection must be closed.
    Malformed,
}

/// Classify a connection's first message by its shape.
///
/// Admin command names and worker report names are disjoint sets, so the
/// order of the two parse attempts does not matter.
pub fn classify_first_message(payload: &[u8]) -> PeerHello {
    if let Ok(cmd) = serde_json::from_slice::<AdminCommand>(payload) {
        return PeerHello::Admin(cmd);
    }
    if let Ok(report) = serde_json::from_slice::<WorkerReport>(payload) {
        return PeerHello::Worker(report);
    }
    PeerHello::Malformed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_command_wire_shape() {
        let cmd = AdminCommand::RelayCommand {
            instance_id: "w1".to_string(),
            sub_command: "sendText".to_string(),
            target_args: serde_json::json!({"to": "19995550123"}),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "relayCommand");
        assert_eq!(json["instanceId"], "w1");
        assert_eq!(json["subCommand"], "sendText");
    }

    #[test]
    fn test_worker_report_wire_shape() {
        let json = r#"{
            "type": "status",
            "instanceId": "linking-abc123",
            "data": {"status": "connected", "message": "session open",
                     "phoneNumber": "19995550123", "name": "Ann"}
        }"#;
        let report: WorkerReport = serde_json::from_str(json).unwrap();
        match report {
            WorkerReport::Status { instance_id, data } => {
                assert_eq!(instance_id, "linking-abc123");
                assert_eq!(data.status, WorkerStatus::Connected);
                assert_eq!(data.phone_number.as_deref(), Some("19995550123"));
            }
            other => panic!("expected status report, got {other:?}"),
        }
    }

    #[test]
    fn test_worker_status_unknown_fallback() {
        let report: StatusReport =
            serde_json::from_str(r#"{"status": "rebalancing", "message": ""}"#).unwrap();
        assert_eq!(report.status, WorkerStatus::Unknown);
    }

    #[test]
    fn test_relayed_command_flattens_args() {
        let mut args = serde_json::Map::new();
        args.insert("to".to_string(), serde_json::json!("19995550123"));
        args.insert("body".to_string(), serde_json::json!("hello"));
        let directive = WorkerDirective::RelayedCommand {
            instance_id: "w1".to_string(),
            sub_command: "sendText".to_string(),
            args,
        };
        let json = serde_json::to_value(&directive).unwrap();
        assert_eq!(json["type"], "relayedCommand");
        assert_eq!(json["to"], "19995550123");
        assert_eq!(json["body"], "hello");
    }

    #[test]
    fn test_classify_admin() {
        let hello = classify_first_message(br#"{"type": "listInstances"}"#);
        assert!(matches!(hello, PeerHello::Admin(AdminCommand::ListInstances { .. })));
    }

    #[test]
    fn test_classify_worker() {
        let hello =
            classify_first_message(br#"{"type": "qr", "instanceId": "w1", "data": "QRDATA"}"#);
        assert!(matches!(hello, PeerHello::Worker(WorkerReport::Qr { .. })));
    }

    #[test]
    fn test_classify_malformed() {
        assert!(matches!(
            classify_first_message(br#"{"type": "qr"}"#),
            PeerHello::Malformed
        ));
        assert!(matches!(
            classify_first_message(br#"{"hello": 1}"#),
            PeerHello::Malformed
        ));
        assert!(matches!(classify_first_message(b"not json"), PeerHello::Malformed));
    }

    #[test]
    fn test_server_event_status_tag() {
        let event = ServerEvent::Status {
            status: "qr".to_string(),
            message: "scan the code".to_string(),
            qr: Some("QRDATA".to_string()),
            instance_id: Some("linking-abc123".to_string()),
            phone_number: None,
            name: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["qr"], "QRDATA");
        assert!(json.get("phoneNumber").is_none());
    }
}
