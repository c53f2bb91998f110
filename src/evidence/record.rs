//! On-disk shapes of the session ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

/// Record kind for supervisor lifecycle events.
pub const LIFECYCLE_KIND: &str = "lifecycle";

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub schema_version: u32,
    pub session_id: String,
    pub recorded_at: DateTime<Utc>,
    pub kind: String,
    pub payload: Value,
}

impl EvidenceRecord {
    pub fn new(session_id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            session_id: session_id.into(),
            recorded_at: Utc::now(),
            kind: kind.into(),
            payload,
        }
    }

    /// Session status carried by a `session_complete` lifecycle event.
    pub fn completion_status(&self) -> Option<&str> {
        if self.kind != LIFECYCLE_KIND
            || self.payload.get("event_type").and_then(Value::as_str) != Some("session_complete")
        {
            return None;
        }
        self.payload.get("status").and_then(Value::as_str)
    }
}

/// `session.json`: summary of a session's ledger, rewritten after every append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSessionMetadata {
    pub schema_version: u32,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub record_count: u64,
    /// Final status once the session has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl EvidenceSessionMetadata {
    pub fn new(session_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            session_id: session_id.into(),
            created_at,
            updated_at: created_at,
            record_count: 0,
            status: None,
        }
    }

    /// Fold a freshly appended record into the summary.
    pub fn absorb(&mut self, record: &EvidenceRecord) {
        self.updated_at = record.recorded_at;
        self.record_count = self.record_count.saturating_add(1);
        if let Some(status) = record.completion_status() {
            self.status = Some(status.to_string());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_some()
    }
}
