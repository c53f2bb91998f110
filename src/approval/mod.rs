//! Asynchronous human approval.
//!
//! A request is persisted as `pending` and announced through a [`Notifier`].
//! A decision arrives later, out of band, keyed by the request's monotonic
//! approval ID: as a file dropped into the mailbox directory or as an HTTP
//! callback. Each request makes exactly one terminal transition
//! (`approved`, `rejected` or `timeout`); later callbacks for the same ID are
//! acknowledged without effect.

mod gateway;
mod mailbox;
mod notifier;
pub mod server;
mod store;

use std::fmt;
use std::io;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gateway::ApprovalGateway;
pub use mailbox::{Mailbox, MailboxMessage};
pub use notifier::{LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use store::ApprovalStore;

#[cfg(test)]
pub(crate) use notifier::RecordingNotifier;

/// Errors that can occur during approval operations.
#[derive(Error, Debug)]
pub enum ApprovalError {
    /// No request with this ID exists.
    #[error("unknown approval ID: {0}")]
    UnknownId(String),

    /// The ID is not a valid approval identifier.
    #[error("invalid approval ID: {0:?}")]
    InvalidId(String),

    /// IO error while reading or writing approval state.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for approval operations.
pub type ApprovalResult<T> = Result<T, ApprovalError>;

/// Lifecycle status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human's answer to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn status(self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        }
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "yes" => Ok(Decision::Approve),
            "reject" | "rejected" | "no" => Ok(Decision::Reject),
            other => Err(format!("unknown decision {:?}", other)),
        }
    }
}

/// Channel a terminal transition came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMethod {
    Mailbox,
    Http,
    Direct,
    TimeoutSweep,
}

/// A persisted approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub decision_info: serde_json::Value,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_method: Option<ResponseMethod>,
}

/// Result of applying a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// The request transitioned to the returned terminal state.
    Applied(ApprovalRequest),
    /// The request had already been decided; nothing changed.
    AlreadyTerminal(ApprovalRequest),
}

impl ResolveOutcome {
    pub fn request(&self) -> &ApprovalRequest {
        match self {
            ResolveOutcome::Applied(r) | ResolveOutcome::AlreadyTerminal(r) => r,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, ResolveOutcome::Applied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_parsing() {
        assert_eq!("approve".parse::<Decision>(), Ok(Decision::Approve));
        assert_eq!(" Reject ".parse::<Decision>(), Ok(Decision::Reject));
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn test_request_serializes_type_field() {
        let now = Utc::now();
        let request = ApprovalRequest {
            id: "apr-000001".into(),
            run_id: "run-1".into(),
            action_type: "delete-files".into(),
            decision_info: serde_json::json!({"paths": ["a"]}),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now,
            responded_at: None,
            response_method: None,
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["type"], "delete-files");
        assert_eq!(json["status"], "pending");
        assert!(json.get("responded_at").is_none());
    }
}
