use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::evidence::record::{EvidenceRecord, EvidenceSessionMetadata, EVIDENCE_SCHEMA_VERSION};
use crate::evidence::store::{EvidenceError, EvidenceResult, EvidenceStore, EvidenceStoreConfig};
use crate::metrics::{SessionMetrics, SessionMetricsStore};

/// Stable export status for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Success,
    PartialFailure,
    Denied,
    Incomplete,
}

/// Exported evidence bundle for a single session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSessionExport {
    pub schema_version: u32,
    pub session_id: String,
    pub status: SessionStatus,
    pub metadata: Option<EvidenceSessionMetadata>,
    pub metrics: Option<SessionMetrics>,
    pub events: Vec<EvidenceRecord>,
}

/// Evidence exporter that assembles session metadata, events, and metrics.
#[derive(Debug, Clone)]
pub struct EvidenceExporter {
    evidence_store: EvidenceStore,
    metrics_store: SessionMetricsStore,
}

impl EvidenceExporter {
    /// Create a new exporter rooted at the given state directory.
    pub fn new(state_dir: impl Into<PathBuf>) -> EvidenceResult<Self> {
        let state_dir = state_dir.into();
        let evidence_store = EvidenceStore::new(&state_dir, EvidenceStoreConfig::default())?;
        let metrics_store = SessionMetricsStore::new(&state_dir);
        Ok(Self {
            evidence_store,
            metrics_store,
        })
    }

    /// Export a single session as a consolidated JSON document.
    pub fn export_session(&self, session_id: &str) -> EvidenceResult<EvidenceSessionExport> {
        if session_id.trim().is_empty() {
            return Err(EvidenceError::InvalidSessionId);
        }

        let metadata = self.evidence_store.load_metadata(session_id)?;
        let events = self.evidence_store.load_events(session_id)?;
        if metadata.is_none() && events.is_empty() {
            return Err(EvidenceError::SessionNotFound(session_id.to_string()));
        }
        let metrics = self.metrics_store.load(session_id)?;
        let status = determine_session_status(&events);

        Ok(EvidenceSessionExport {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            session_id: session_id.to_string(),
            status,
            metadata,
            metrics,
            events,
        })
    }

    /// Export the most recently created session, if any.
    pub fn export_latest(&self) -> EvidenceResult<Option<EvidenceSessionExport>> {
        match self.evidence_store.list_sessions()?.pop() {
            Some(latest) => self.export_session(&latest.session_id).map(Some),
            None => Ok(None),
        }
    }
}

fn determine_session_status(events: &[EvidenceRecord]) -> SessionStatus {
    match events.iter().rev().find_map(EvidenceRecord::completion_status) {
        Some("success") | Some("already_running") => SessionStatus::Success,
        Some("governance_denied") => SessionStatus::Denied,
        Some("partial_failure") => SessionStatus::PartialFailure,
        _ => SessionStatus::Incomplete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::evidence::writer::EvidenceWriter;
    use crate::metrics::SessionMetricsCollector;

    fn writer(temp_dir: &TempDir, session_id: &str) -> EvidenceWriter {
        EvidenceWriter::new(
            temp_dir.path(),
            session_id.to_string(),
            EvidenceStoreConfig::new(30),
        )
        .expect("writer")
    }

    #[test]
    fn test_export_session_includes_metrics_and_events() {
        let temp_dir = TempDir::new().expect("temp dir");
        let session_id = "session-123";
        let writer = writer(&temp_dir, session_id);

        writer.emit_session_start(serde_json::json!({"runs": ["run-a"]}));
        writer.emit_session_complete("success", None);

        let collector = SessionMetricsCollector::new(session_id, 1);
        collector.start_run("run-a");
        collector.complete_run("run-a", "completed", 1, Duration::from_secs(1), None);
        SessionMetricsStore::new(temp_dir.path())
            .save(&collector.finish())
            .expect("save metrics");

        let exporter = EvidenceExporter::new(temp_dir.path()).expect("exporter");
        let export = exporter.export_session(session_id).expect("export session");

        assert_eq!(export.session_id, session_id);
        assert_eq!(export.status, SessionStatus::Success);
        assert!(export.metrics.is_some());
        assert_eq!(export.events.len(), 2);
    }

    #[test]
    fn test_export_session_marks_incomplete_without_completion() {
        let temp_dir = TempDir::new().expect("temp dir");
        let writer = writer(&temp_dir, "session-456");
        writer.emit_session_start(serde_json::json!({}));

        let exporter = EvidenceExporter::new(temp_dir.path()).expect("exporter");
        let export = exporter.export_session("session-456").expect("export session");

        assert_eq!(export.status, SessionStatus::Incomplete);
        assert!(export.metrics.is_none());
    }

    #[test]
    fn test_export_session_maps_denied_and_partial() {
        let temp_dir = TempDir::new().expect("temp dir");
        writer(&temp_dir, "session-denied").emit_session_complete("governance_denied", None);
        writer(&temp_dir, "session-partial").emit_session_complete("partial_failure", None);

        let exporter = EvidenceExporter::new(temp_dir.path()).expect("exporter");
        assert_eq!(
            exporter.export_session("session-denied").expect("export").status,
            SessionStatus::Denied
        );
        assert_eq!(
            exporter.export_session("session-partial").expect("export").status,
            SessionStatus::PartialFailure
        );
    }

    #[test]
    fn test_export_unknown_session_is_not_found() {
        let temp_dir = TempDir::new().expect("temp dir");
        let exporter = EvidenceExporter::new(temp_dir.path()).expect("exporter");

        assert!(matches!(
            exporter.export_session("session-missing"),
            Err(EvidenceError::SessionNotFound(_))
        ));
        assert!(exporter.export_latest().expect("latest").is_none());
    }
}
