use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;

/// Types of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditEventType {
    // Permission lifecycle
    PermissionRequested,
    PermissionApproved,
    PermissionDenied,
    PermissionAutoApproved,
    PermissionTimeout,

    // Policy engine
    PolicyEvaluated,
    PolicyMatched,

    // Agent phases
    PhaseTransition,

    // Bridge lifecycle
    BridgeStarted,
    BridgeStopped,
    AgentStarted,
    AgentExit,

    // Transport health
    TransportConnected,
    TransportDisconnected,
    TransportReconnected,
    CallbackReceived,

    // Log management
    LogRotated,

    // Problems
    Error,
    Warning,
}

/// A single audit log entry payload.
///
/// Optional fields are omitted from the serialized form entirely so the
/// canonical encoding stays stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: AuditEventType,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event_type,
            session_id: String::new(),
            request_id: None,
            user_id: None,
            action: None,
            target: None,
            risk_level: None,
            policy_name: None,
            phase: None,
            metadata: Map::new(),
            error: None,
        }
    }

    pub fn at(event_type: AuditEventType, when: DateTime<Utc>) -> Self {
        let mut event = Self::new(event_type);
        event.timestamp = when.to_rfc3339_opts(SecondsFormat::Micros, true);
        event
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn user_id(mut self, id: u64) -> Self {
        self.user_id = Some(id);
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn risk_level(mut self, risk: impl Into<String>) -> Self {
        self.risk_level = Some(risk.into());
        self
    }

    pub fn policy_name(mut self, name: impl Into<String>) -> Self {
        self.policy_name = Some(name.into());
        self
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn error_text(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Canonical encoding used for signing: keys sorted, no extraneous
    /// whitespace, UTF-8 bytes. `serde_json`'s object representation is a
    /// `BTreeMap`, so routing through `Value` sorts keys.
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        Ok(serde_json::to_value(self)?.to_string())
    }
}

/// One line of the audit store: the event plus its chain linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event: Value,
    pub hmac: String,
    pub prev_hash: String,
}

#[cfg(test)]
mod tests {
    use super::{AuditEvent, AuditEventType};

    #[test]
    fn canonical_json_sorts_keys_and_is_compact() {
        let event = AuditEvent::new(AuditEventType::PermissionRequested)
            .request_id("ab12cd34")
            .action("file_edit")
            .target("src/main.rs");
        let json = event.canonical_json().unwrap();
        assert!(!json.contains(' '));
        let action_pos = json.find("\"action\"").unwrap();
        let target_pos = json.find("\"target\"").unwrap();
        let ts_pos = json.find("\"timestamp\"").unwrap();
        assert!(action_pos < target_pos);
        assert!(target_pos < ts_pos);
    }

    #[test]
    fn unset_fields_are_omitted() {
        let json = AuditEvent::new(AuditEventType::BridgeStarted)
            .canonical_json()
            .unwrap();
        assert!(!json.contains("request_id"));
        assert!(!json.contains("metadata"));
        assert!(!json.contains("user_id"));
    }

    #[test]
    fn event_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AuditEventType::PermissionAutoApproved).unwrap(),
            "\"permission_auto_approved\""
        );
        assert_eq!(
            AuditEventType::PhaseTransition.to_string(),
            "phase_transition"
        );
    }
}
