use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::warn;

use crate::evidence::store::EvidenceStoreConfig;
use crate::evidence::lifecycle::{SessionEvent, SessionEventType};
use crate::evidence::record::{EvidenceRecord, LIFECYCLE_KIND};
use crate::evidence::store::{EvidenceResult, EvidenceStore};

/// Terminal outcome of one run, as written to the ledger.
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    pub outcome: String,
    pub reason: Option<String>,
    pub attempts: u32,
    pub approval_id: Option<String>,
    pub message: Option<String>,
}

/// Records session lifecycle events to durable storage.
///
/// Writes are best-effort: a failed append is logged and the session carries
/// on. Clones share one append lock so concurrent workers never interleave
/// partial lines.
#[derive(Debug, Clone)]
pub struct EvidenceWriter {
    session_id: String,
    store: EvidenceStore,
    append_lock: Arc<Mutex<()>>,
}

impl EvidenceWriter {
    pub fn new(state_dir: &Path, session_id: String, config: EvidenceStoreConfig) -> EvidenceResult<Self> {
        Ok(Self {
            session_id,
            store: EvidenceStore::new(state_dir, config)?,
            append_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    pub fn emit_session_start(&self, details: Value) {
        let mut event = SessionEvent::new(SessionEventType::SessionStart, self.session_id.clone());
        event.details = Some(details);
        self.write_event(event);
    }

    pub fn emit_run_transition(&self, run_id: &str, state: &str, attempt: u32) {
        let mut event = SessionEvent::new(SessionEventType::RunTransition, self.session_id.clone());
        event.run_id = Some(run_id.to_string());
        event.state = Some(state.to_string());
        event.attempt = Some(attempt);
        self.write_event(event);
    }

    pub fn emit_run_complete(&self, run_id: &str, completion: RunCompletion) {
        let mut event = SessionEvent::new(SessionEventType::RunComplete, self.session_id.clone());
        event.run_id = Some(run_id.to_string());
        event.status = Some(completion.outcome);
        event.reason = completion.reason;
        event.attempt = Some(completion.attempts);
        event.approval_id = completion.approval_id;
        event.message = completion.message;
        self.write_event(event);
    }

    pub fn emit_session_complete(&self, status: &str, reason: Option<String>) {
        let mut event = SessionEvent::new(SessionEventType::SessionComplete, self.session_id.clone());
        event.status = Some(status.to_string());
        event.reason = reason;
        self.write_event(event);
    }

    fn write_event(&self, event: SessionEvent) {
        let payload: Value = match serde_json::to_value(&event) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "Failed to serialize evidence event");
                return;
            }
        };

        let record = EvidenceRecord::new(self.session_id.clone(), LIFECYCLE_KIND, payload);
        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = self.store.append_record(&record) {
            warn!(
                path = %self.store.root_dir().display(),
                error = %err,
                "Failed to write evidence event"
            );
        }
    }
}

pub fn generate_session_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let pid = std::process::id();
    format!("session-{}-{}", timestamp_ms, pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_session_id_format() {
        let id = generate_session_id();
        assert!(id.starts_with("session-"));
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }

    #[test]
    fn test_writer_records_run_completion() {
        let temp_dir = TempDir::new().expect("temp dir");
        let writer = EvidenceWriter::new(
            temp_dir.path(),
            "session-1".to_string(),
            EvidenceStoreConfig::new(30),
        )
        .expect("writer");

        writer.emit_session_start(serde_json::json!({"runs": ["run-a"]}));
        writer.emit_run_transition("run-a", "locked", 1);
        writer.emit_run_complete(
            "run-a",
            RunCompletion {
                outcome: "escalated".into(),
                reason: Some("permission-denied".into()),
                attempts: 3,
                ..RunCompletion::default()
            },
        );

        let events = writer.store().load_events("session-1").expect("events");
        assert_eq!(events.len(), 3);
        let last: SessionEvent =
            serde_json::from_value(events[2].payload.clone()).expect("event");
        assert_eq!(last.event_type, SessionEventType::RunComplete);
        assert_eq!(last.reason.as_deref(), Some("permission-denied"));
        assert_eq!(last.attempt, Some(3));
    }
}
