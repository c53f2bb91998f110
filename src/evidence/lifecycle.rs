use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

const SCHEMA_VERSION: &str = "v1";

/// Ledger event types for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventType {
    SessionStart,
    RunTransition,
    RunComplete,
    SessionComplete,
}

/// Lifecycle event payload stored as evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub schema_version: String,
    pub event_type: SessionEventType,
    pub timestamp: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Run state entered (for transitions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Run outcome or session status label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Free-form event details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl SessionEvent {
    pub fn new(event_type: SessionEventType, session_id: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_type,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session_id,
            run_id: None,
            state: None,
            attempt: None,
            status: None,
            reason: None,
            approval_id: None,
            message: None,
            details: None,
        }
    }
}
