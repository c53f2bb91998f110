use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::QueueItem;
use crate::governance::ProtectedPaths;
use crate::retry::{classify_failure, reasons};

/// Why a queued action could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyFailure {
    /// Retry policy key.
    pub reason: String,
    pub message: String,
}

impl ApplyFailure {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Classify an IO error into a retry reason.
    pub fn from_io(err: &io::Error) -> Self {
        let reason = match err.kind() {
            io::ErrorKind::PermissionDenied => reasons::PERMISSION_DENIED,
            io::ErrorKind::AlreadyExists => reasons::DETERMINISTIC_COLLISION,
            _ => classify_failure(&err.to_string()),
        };
        Self::new(reason, err.to_string())
    }
}

/// Performs the work described by a queue item.
#[async_trait]
pub trait ActionApplier: Send + Sync {
    async fn apply(&self, item: &QueueItem) -> Result<(), ApplyFailure>;
}

/// Applies `file_move` items as renames under a project root.
#[derive(Debug, Clone)]
pub struct FileMoveApplier {
    root: PathBuf,
    protected: ProtectedPaths,
}

impl FileMoveApplier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            protected: ProtectedPaths::default(),
        }
    }

    /// Refuse moves whose destination matches one of `protected`.
    pub fn with_protected_paths(mut self, protected: ProtectedPaths) -> Self {
        self.protected = protected;
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }
}

#[async_trait]
impl ActionApplier for FileMoveApplier {
    async fn apply(&self, item: &QueueItem) -> Result<(), ApplyFailure> {
        let Some(destination) = item.destination.as_deref() else {
            return Err(ApplyFailure::new(
                reasons::UNKNOWN,
                format!("queue item {} has no destination", item.id),
            ));
        };

        if self.protected.matches(destination) {
            return Err(ApplyFailure::new(
                reasons::PROTECTED_PATH,
                format!("destination {} is a protected path", destination),
            ));
        }

        let source = self.resolve(&item.source);
        let target = self.resolve(destination);

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(ApplyFailure::new(
                reasons::DETERMINISTIC_COLLISION,
                format!("destination {} already exists", target.display()),
            ));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ApplyFailure::from_io(&e))?;
        }

        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| ApplyFailure::from_io(&e))?;

        debug!(source = %source.display(), destination = %target.display(), "File moved");
        Ok(())
    }
}
