//! Statewire wire protocol v1.
//!
//! JSON-over-WebSocket. The server sends [`SyncEvent`] frames (snapshot, patch,
//! lifecycle, override_rejected); the client sends [`ClientFrame`]s (override,
//! resync).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncError;
use crate::patch::{PatchDraft, PatchEvent, PatchMode};
use crate::session::SessionStatus;

/// Protocol version implemented by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Server -> client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Full state, used to bootstrap or resynchronize a subscriber.
    Snapshot {
        #[serde(rename = "sequenceNumber")]
        seq: u64,
        payload: Value,
        status: SessionStatus,
    },

    /// Incremental change to one field.
    Patch(PatchEvent),

    /// Session status change.
    Lifecycle {
        #[serde(rename = "sequenceNumber")]
        seq: u64,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// An override was refused. Addressed to the originating subscriber only
    /// and not part of the session sequence.
    OverrideRejected {
        #[serde(rename = "overrideId")]
        override_id: String,
        #[serde(rename = "targetField")]
        target_field: String,
        error: ErrorShape,
    },
}

impl SyncEvent {
    /// Session sequence number, for sequenced events.
    pub fn seq(&self) -> Option<u64> {
        match self {
            SyncEvent::Snapshot { seq, .. } | SyncEvent::Lifecycle { seq, .. } => Some(*seq),
            SyncEvent::Patch(p) => Some(p.seq),
            SyncEvent::OverrideRejected { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Snapshot { .. } => "snapshot",
            SyncEvent::Patch(_) => "patch",
            SyncEvent::Lifecycle { .. } => "lifecycle",
            SyncEvent::OverrideRejected { .. } => "override_rejected",
        }
    }
}

/// Error shape carried in lifecycle and rejection events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&SyncError> for ErrorShape {
    fn from(err: &SyncError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}

/// Client-authored write sent upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideCommand {
    pub id: String,
    pub target_field: String,
    pub payload: Value,
    #[serde(default)]
    pub mode: PatchMode,
    pub client_timestamp: DateTime<Utc>,
    /// Last sequence number the client had applied when it staged the write.
    #[serde(default)]
    pub base_seq: u64,
}

impl OverrideCommand {
    pub fn new(target_field: impl Into<String>, payload: Value, mode: PatchMode, base_seq: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_field: target_field.into(),
            payload,
            mode,
            client_timestamp: Utc::now(),
            base_seq,
        }
    }

    pub fn draft(&self) -> PatchDraft {
        PatchDraft::new(self.target_field.clone(), self.payload.clone(), self.mode)
    }
}

/// Client -> server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Override(OverrideCommand),
    /// Ask for a fresh snapshot; the live stream resumes after it.
    Resync,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchDraft;
    use serde_json::json;

    #[test]
    fn test_snapshot_wire_shape() {
        let event = SyncEvent::Snapshot {
            seq: 4,
            payload: json!({"input": "nyc"}),
            status: SessionStatus::Running,
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "snapshot");
        assert_eq!(wire["sequenceNumber"], 4);
        assert_eq!(wire["payload"]["input"], "nyc");
        assert_eq!(wire["status"], "running");
    }

    #[test]
    fn test_patch_event_is_flattened() {
        let event = SyncEvent::Patch(PatchDraft::append("messages", json!("hi")).sequenced(9));
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "patch");
        assert_eq!(wire["targetField"], "messages");
        assert_eq!(wire["mode"], "append");
        assert_eq!(wire["sequenceNumber"], 9);

        let back: SyncEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.seq(), Some(9));
    }

    #[test]
    fn test_rejection_is_unsequenced() {
        let err = SyncError::ConflictOverride {
            field: "input".into(),
            base_seq: 1,
            current_seq: 3,
        };
        let event = SyncEvent::OverrideRejected {
            override_id: "o-1".into(),
            target_field: "input".into(),
            error: ErrorShape::from(&err),
        };
        assert_eq!(event.seq(), None);
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["error"]["code"], "conflict_override");
    }

    #[test]
    fn test_client_frames() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"resync"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Resync);

        let raw = json!({
            "type": "override",
            "id": "o-1",
            "targetField": "input",
            "payload": "sf",
            "clientTimestamp": "2026-01-01T00:00:00Z",
            "baseSeq": 3
        });
        let ClientFrame::Override(cmd) = serde_json::from_value(raw).unwrap() else {
            panic!("expected override frame");
        };
        assert_eq!(cmd.mode, PatchMode::Replace);
        assert_eq!(cmd.base_seq, 3);
    }
}
