//! Top-level error type and process exit codes.

use std::io;
use std::process::ExitCode;

use thiserror::Error;

use crate::anchor::AnchorError;
use crate::approval::ApprovalError;
use crate::evidence::EvidenceError;
use crate::lock::LockError;
use crate::queue::QueueError;
use crate::workspace::WorkspaceError;

/// Errors surfaced by the supervisor and the maintenance commands.
#[derive(Error, Debug)]
pub enum WardenError {
    #[error(transparent)]
    Anchor(#[from] AnchorError),

    #[error("governance denied: {0}")]
    GovernanceDenied(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type for top-level operations.
pub type WardenResult<T> = Result<T, WardenError>;

impl WardenError {
    /// Exit code reported by the binary for this error.
    pub fn exit_code(&self) -> SessionExit {
        match self {
            WardenError::Anchor(_) => SessionExit::AnchorMissing,
            WardenError::GovernanceDenied(_) => SessionExit::GovernanceDenied,
            _ => SessionExit::Internal,
        }
    }
}

/// Distinct process exit codes for a supervision session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Every run completed, or there was nothing to do.
    Success,
    /// Unexpected internal failure.
    Internal,
    /// Parallel execution was requested but the anchor forbids it.
    GovernanceDenied,
    /// The anchor file is missing or unreadable.
    AnchorMissing,
    /// At least one run escalated, was abandoned, or was refused approval.
    PartialFailure,
    /// Every requested run is already owned by another process.
    AlreadyRunning,
}

impl SessionExit {
    /// Numeric process exit code.
    pub fn code(self) -> u8 {
        match self {
            SessionExit::Success => 0,
            SessionExit::Internal => 1,
            SessionExit::GovernanceDenied => 2,
            SessionExit::AnchorMissing => 3,
            SessionExit::PartialFailure => 4,
            SessionExit::AlreadyRunning => 5,
        }
    }

    /// Stable label used in summaries and the evidence ledger.
    pub fn as_label(self) -> &'static str {
        match self {
            SessionExit::Success => "success",
            SessionExit::Internal => "internal_error",
            SessionExit::GovernanceDenied => "governance_denied",
            SessionExit::AnchorMissing => "anchor_missing",
            SessionExit::PartialFailure => "partial_failure",
            SessionExit::AlreadyRunning => "already_running",
        }
    }
}

impl From<SessionExit> for ExitCode {
    fn from(exit: SessionExit) -> Self {
        ExitCode::from(exit.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_exit_codes_are_distinct() {
        let all = [
            SessionExit::Success,
            SessionExit::Internal,
            SessionExit::GovernanceDenied,
            SessionExit::AnchorMissing,
            SessionExit::PartialFailure,
            SessionExit::AlreadyRunning,
        ];
        let mut codes: Vec<u8> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert_eq!(SessionExit::Success.code(), 0);
    }

    #[test]
    fn test_missing_anchor_maps_to_anchor_exit() {
        let err = WardenError::from(AnchorError::Missing(PathBuf::from("anchor.json")));
        assert_eq!(err.exit_code(), SessionExit::AnchorMissing);
    }

    #[test]
    fn test_governance_denied_maps_to_governance_exit() {
        let err = WardenError::GovernanceDenied("parallelism not allowed".into());
        assert_eq!(err.exit_code(), SessionExit::GovernanceDenied);
    }
}
