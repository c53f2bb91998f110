use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ApprovalError, ApprovalResult, Decision};
use crate::fsutil;

/// A decision dropped into the mailbox by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub approval_id: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_by: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Directory of pending decision files, one JSON file per message.
#[derive(Debug, Clone)]
pub struct Mailbox {
    dir: PathBuf,
}

impl Mailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Drop a decision for `approval_id` into the mailbox.
    pub fn submit(
        &self,
        approval_id: &str,
        decision: Decision,
        responded_by: Option<String>,
    ) -> ApprovalResult<PathBuf> {
        if !fsutil::is_safe_component(approval_id) {
            return Err(ApprovalError::InvalidId(approval_id.to_string()));
        }
        let message = MailboxMessage {
            approval_id: approval_id.to_string(),
            decision,
            responded_by,
            submitted_at: Utc::now(),
        };
        let path = self.dir.join(format!(
            "{}-{}.json",
            approval_id,
            message.submitted_at.timestamp_nanos_opt().unwrap_or_default()
        ));
        fsutil::write_json_atomic(&path, &message)?;
        Ok(path)
    }

    /// Read every message currently in the mailbox, oldest first.
    ///
    /// Unparseable files are logged and deleted. Parsed files stay until the
    /// caller removes them with [`Mailbox::remove`].
    pub fn read_all(&self) -> ApprovalResult<Vec<(PathBuf, MailboxMessage)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut messages = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_message = path.extension().and_then(|e| e.to_str()) == Some("json")
                && !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if !is_message {
                continue;
            }
            match fsutil::read_json::<MailboxMessage>(&path) {
                Ok(Some(message)) => messages.push((path, message)),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Discarding malformed mailbox message");
                    let _ = fsutil::remove_if_exists(&path);
                }
            }
        }
        messages.sort_by(|a, b| a.1.submitted_at.cmp(&b.1.submitted_at));
        Ok(messages)
    }

    pub fn remove(&self, path: &Path) -> ApprovalResult<()> {
        fsutil::remove_if_exists(path)?;
        Ok(())
    }
}
