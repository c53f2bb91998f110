use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use thiserror::Error;

use crate::evidence::record::{EvidenceRecord, EvidenceSessionMetadata};
use crate::fsutil;

const EVIDENCE_DIR_NAME: &str = "evidence";
const SESSIONS_DIR_NAME: &str = "sessions";
const MANIFEST_FILE_NAME: &str = "session.json";
const EVENTS_FILE_NAME: &str = "events.jsonl";

pub const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Retention settings for the ledger. `retention_days = 0` keeps every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvidenceStoreConfig {
    pub retention_days: u64,
}

impl EvidenceStoreConfig {
    pub fn new(retention_days: u64) -> Self {
        Self { retention_days }
    }
}

impl Default for EvidenceStoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_DAYS)
    }
}

/// Errors that can occur during evidence storage operations.
#[derive(Error, Debug)]
pub enum EvidenceError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid session identifier.
    #[error("Invalid session ID")]
    InvalidSessionId,

    /// No ledger exists for the session.
    #[error("No evidence for session {0}")]
    SessionNotFound(String),
}

/// Result type for evidence storage operations.
pub type EvidenceResult<T> = Result<T, EvidenceError>;

/// Evidence store backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root_dir: PathBuf,
    retention_days: u64,
}

impl EvidenceStore {
    /// Create a new evidence store under `<state_dir>/evidence`.
    pub fn new(state_dir: &Path, config: EvidenceStoreConfig) -> EvidenceResult<Self> {
        let root_dir = state_dir.join(EVIDENCE_DIR_NAME);
        fs::create_dir_all(root_dir.join(SESSIONS_DIR_NAME))?;
        Ok(Self {
            root_dir,
            retention_days: config.retention_days,
        })
    }

    fn validate(session_id: &str) -> EvidenceResult<()> {
        if fsutil::is_safe_component(session_id) {
            Ok(())
        } else {
            Err(EvidenceError::InvalidSessionId)
        }
    }

    /// Append a single evidence record for a session.
    pub fn append_record(&self, record: &EvidenceRecord) -> EvidenceResult<()> {
        Self::validate(&record.session_id)?;

        let session_dir = self.session_dir(&record.session_id);
        fs::create_dir_all(&session_dir)?;

        let events_path = session_dir.join(EVENTS_FILE_NAME);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)?;

        let json = serde_json::to_string(record)?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;

        let manifest_path = session_dir.join(MANIFEST_FILE_NAME);
        let mut metadata = self
            .read_metadata(&manifest_path)?
            .unwrap_or_else(|| EvidenceSessionMetadata::new(&record.session_id, record.recorded_at));
        metadata.absorb(record);
        fsutil::write_json_atomic(&manifest_path, &metadata)?;

        Ok(())
    }

    /// Load the manifest of a session.
    pub fn load_metadata(&self, session_id: &str) -> EvidenceResult<Option<EvidenceSessionMetadata>> {
        Self::validate(session_id)?;
        self.read_metadata(&self.session_dir(session_id).join(MANIFEST_FILE_NAME))
    }

    /// Load every record of a session in append order.
    pub fn load_events(&self, session_id: &str) -> EvidenceResult<Vec<EvidenceRecord>> {
        Self::validate(session_id)?;
        let path = self.session_dir(session_id).join(EVENTS_FILE_NAME);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(EvidenceError::Io(err)),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Manifests of all sessions, oldest first.
    pub fn list_sessions(&self) -> EvidenceResult<Vec<EvidenceSessionMetadata>> {
        let sessions_dir = self.root_dir.join(SESSIONS_DIR_NAME);
        if !sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in fs::read_dir(&sessions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(metadata) = self.read_metadata(&entry.path().join(MANIFEST_FILE_NAME))? {
                sessions.push(metadata);
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Delete all evidence for a specific session.
    pub fn delete_session(&self, session_id: &str) -> EvidenceResult<()> {
        Self::validate(session_id)?;

        let session_dir = self.session_dir(session_id);
        match fs::remove_dir_all(&session_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(EvidenceError::Io(err)),
        }
    }

    /// Apply retention rules and delete expired sessions.
    ///
    /// Returns the IDs of the deleted sessions.
    pub fn enforce_retention(&self) -> EvidenceResult<Vec<String>> {
        if self.retention_days == 0 {
            return Ok(Vec::new());
        }

        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let mut deleted = Vec::new();

        for metadata in self.list_sessions()? {
            if metadata.created_at < cutoff {
                fs::remove_dir_all(self.session_dir(&metadata.session_id))?;
                deleted.push(metadata.session_id);
            }
        }

        Ok(deleted)
    }

    /// Get the evidence root directory path.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root_dir.join(SESSIONS_DIR_NAME).join(session_id)
    }

    fn read_metadata(&self, manifest_path: &Path) -> EvidenceResult<Option<EvidenceSessionMetadata>> {
        match fs::read_to_string(manifest_path) {
            Ok(content) => {
                let metadata = serde_json::from_str(&content)?;
                Ok(Some(metadata))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(EvidenceError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_append_record_writes_files() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store =
            EvidenceStore::new(temp_dir.path(), EvidenceStoreConfig::new(30)).expect("store");
        let record = EvidenceRecord::new("session-123", "lifecycle", json!({"event": "start"}));

        store.append_record(&record).expect("append");
        store.append_record(&record).expect("append");

        let session_dir = store.root_dir().join(SESSIONS_DIR_NAME).join("session-123");
        assert!(session_dir.join(EVENTS_FILE_NAME).exists());
        let metadata = store
            .load_metadata("session-123")
            .expect("metadata")
            .expect("present");
        assert_eq!(metadata.record_count, 2);
        assert_eq!(store.load_events("session-123").expect("events").len(), 2);
    }

    #[test]
    fn test_invalid_session_id_rejected() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store =
            EvidenceStore::new(temp_dir.path(), EvidenceStoreConfig::new(30)).expect("store");
        let record = EvidenceRecord::new("../escape", "lifecycle", json!({}));

        assert!(matches!(
            store.append_record(&record),
            Err(EvidenceError::InvalidSessionId)
        ));
    }

    #[test]
    fn test_delete_session_removes_evidence() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store =
            EvidenceStore::new(temp_dir.path(), EvidenceStoreConfig::new(30)).expect("store");
        let record = EvidenceRecord::new("session-999", "lifecycle", json!({"count": 1}));

        store.append_record(&record).expect("append");
        store.delete_session("session-999").expect("delete");

        assert!(store.list_sessions().expect("list").is_empty());
    }

    #[test]
    fn test_enforce_retention_deletes_expired_sessions() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store =
            EvidenceStore::new(temp_dir.path(), EvidenceStoreConfig::new(30)).expect("store");

        let record = EvidenceRecord::new("session-old", "lifecycle", json!({"event": "start"}));
        store.append_record(&record).expect("append");
        let fresh = EvidenceRecord::new("session-new", "lifecycle", json!({"event": "start"}));
        store.append_record(&fresh).expect("append");

        let manifest_path = store
            .root_dir()
            .join(SESSIONS_DIR_NAME)
            .join("session-old")
            .join(MANIFEST_FILE_NAME);
        let mut metadata: EvidenceSessionMetadata =
            serde_json::from_str(&fs::read_to_string(&manifest_path).expect("manifest"))
                .expect("metadata");
        metadata.created_at = Utc::now() - Duration::days(45);
        metadata.updated_at = metadata.created_at;
        fs::write(&manifest_path, serde_json::to_string_pretty(&metadata).expect("serialize"))
            .expect("write");

        let deleted = store.enforce_retention().expect("retention");
        assert_eq!(deleted, vec!["session-old".to_string()]);
        let remaining: Vec<String> = store
            .list_sessions()
            .expect("list")
            .into_iter()
            .map(|m| m.session_id)
            .collect();
        assert_eq!(remaining, vec!["session-new".to_string()]);
    }

    #[test]
    fn test_enforce_retention_disabled() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store =
            EvidenceStore::new(temp_dir.path(), EvidenceStoreConfig::new(0)).expect("store");
        let record = EvidenceRecord::new("session-keep", "lifecycle", json!({"event": "start"}));

        store.append_record(&record).expect("append");
        let deleted = store.enforce_retention().expect("retention");

        assert!(deleted.is_empty());
        assert_eq!(store.list_sessions().expect("list").len(), 1);
    }
}
