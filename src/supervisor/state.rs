use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SessionExit;

/// States a run moves through within one session.
///
/// The order is strict: `Queued -> Locked -> WorkspaceLeased -> Executing`,
/// optionally `AwaitingApproval` and back to `Executing`, then one of the
/// three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Locked,
    WorkspaceLeased,
    Executing,
    AwaitingApproval,
    Completed,
    FailedRetryScheduled,
    FailedEscalated,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Locked => "locked",
            RunState::WorkspaceLeased => "workspace_leased",
            RunState::Executing => "executing",
            RunState::AwaitingApproval => "awaiting_approval",
            RunState::Completed => "completed",
            RunState::FailedRetryScheduled => "failed_retry_scheduled",
            RunState::FailedEscalated => "failed_escalated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::FailedRetryScheduled | RunState::FailedEscalated
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended in this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Retry deferred to a later session through the pending queue.
    RetryScheduled {
        queue_id: String,
        next_retry_at: DateTime<Utc>,
    },
    /// Retries exhausted; handed to a human (`needs_manual`).
    Escalated,
    /// Retries exhausted; dropped.
    Abandoned,
    ApprovalRejected,
    /// Nobody answered the approval request in time.
    ApprovalTimedOut,
    /// Another live process holds the run lock.
    AlreadyRunning { holder_pid: Option<u32> },
    /// The session stopped before the run was dispatched.
    NotStarted,
    /// Lock, workspace or queue machinery failed.
    Infrastructure { message: String },
}

impl RunOutcome {
    /// Stable label for metrics and the evidence ledger.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::RetryScheduled { .. } => "retry_scheduled",
            RunOutcome::Escalated => "escalated",
            RunOutcome::Abandoned => "abandoned",
            RunOutcome::ApprovalRejected => "approval_rejected",
            RunOutcome::ApprovalTimedOut => "approval_timeout",
            RunOutcome::AlreadyRunning { .. } => "already_running",
            RunOutcome::NotStarted => "not_started",
            RunOutcome::Infrastructure { .. } => "infrastructure_error",
        }
    }

    /// Terminal outcomes that count against the session.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RunOutcome::Escalated
                | RunOutcome::Abandoned
                | RunOutcome::ApprovalRejected
                | RunOutcome::ApprovalTimedOut
                | RunOutcome::Infrastructure { .. }
        )
    }

    /// Terminal run state reached, if the run was dispatched at all.
    pub fn final_state(&self) -> Option<RunState> {
        match self {
            RunOutcome::Completed => Some(RunState::Completed),
            RunOutcome::RetryScheduled { .. } => Some(RunState::FailedRetryScheduled),
            RunOutcome::Escalated
            | RunOutcome::Abandoned
            | RunOutcome::ApprovalRejected
            | RunOutcome::ApprovalTimedOut
            | RunOutcome::Infrastructure { .. } => Some(RunState::FailedEscalated),
            RunOutcome::AlreadyRunning { .. } | RunOutcome::NotStarted => None,
        }
    }
}

/// Terminal record of one run: id, outcome, reason and attempt count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    /// Total executor attempts, including earlier sessions.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    pub duration_ms: u64,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, outcome: RunOutcome) -> Self {
        Self {
            run_id: run_id.into(),
            outcome,
            attempts: 0,
            reason: None,
            last_error: None,
            approval_id: None,
            duration_ms: 0,
        }
    }
}

/// Everything a session did.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub workers: usize,
    pub runs: Vec<RunRecord>,
}

impl SessionReport {
    /// Exit status for the session.
    ///
    /// Any failed run makes it a partial failure; a session whose every run
    /// was skipped on contention reports already-running.
    pub fn exit(&self) -> SessionExit {
        if self.runs.iter().any(|r| r.outcome.is_failure()) {
            return SessionExit::PartialFailure;
        }
        let all_contended = !self.runs.is_empty()
            && self
                .runs
                .iter()
                .all(|r| matches!(r.outcome, RunOutcome::AlreadyRunning { .. }));
        if all_contended {
            return SessionExit::AlreadyRunning;
        }
        SessionExit::Success
    }

    /// Number of runs per outcome label.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for run in &self.runs {
            *counts.entry(run.outcome.label()).or_insert(0) += 1;
        }
        counts
    }

    pub fn get(&self, run_id: &str) -> Option<&RunRecord> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "session {} ({} worker{})",
            self.session_id,
            self.workers,
            if self.workers == 1 { "" } else { "s" }
        )?;
        for run in &self.runs {
            write!(f, "  {:<24} {:<20} attempts={}", run.run_id, run.outcome.label(), run.attempts)?;
            if let Some(reason) = &run.reason {
                write!(f, " reason={}", reason)?;
            }
            if let Some(approval_id) = &run.approval_id {
                write!(f, " approval={}", approval_id)?;
            }
            match &run.outcome {
                RunOutcome::RetryScheduled { next_retry_at, .. } => {
                    write!(f, " next_retry_at={}", next_retry_at.to_rfc3339())?
                }
                RunOutcome::AlreadyRunning {
                    holder_pid: Some(pid),
                } => write!(f, " holder_pid={}", pid)?,
                RunOutcome::Infrastructure { message } => write!(f, " error={}", message)?,
                _ => {}
            }
            writeln!(f)?;
        }
        write!(f, "exit: {}", self.exit().as_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcomes: Vec<RunOutcome>) -> SessionReport {
        SessionReport {
            session_id: "session-1".to_string(),
            workers: 1,
            runs: outcomes
                .into_iter()
                .enumerate()
                .map(|(i, o)| RunRecord::new(format!("run-{}", i), o))
                .collect(),
        }
    }

    #[test]
    fn test_exit_success_includes_scheduled_retries() {
        let report = report(vec![
            RunOutcome::Completed,
            RunOutcome::RetryScheduled {
                queue_id: "q-1".into(),
                next_retry_at: Utc::now(),
            },
        ]);
        assert_eq!(report.exit(), SessionExit::Success);
    }

    #[test]
    fn test_exit_partial_failure_wins() {
        let report = report(vec![
            RunOutcome::AlreadyRunning { holder_pid: Some(1) },
            RunOutcome::ApprovalTimedOut,
        ]);
        assert_eq!(report.exit(), SessionExit::PartialFailure);
    }

    #[test]
    fn test_exit_already_running_when_all_contended() {
        let report = report(vec![
            RunOutcome::AlreadyRunning { holder_pid: Some(1) },
            RunOutcome::AlreadyRunning { holder_pid: None },
        ]);
        assert_eq!(report.exit(), SessionExit::AlreadyRunning);
        assert_eq!(report.counts().get("already_running"), Some(&2));
    }

    #[test]
    fn test_empty_session_is_success() {
        assert_eq!(report(vec![]).exit(), SessionExit::Success);
    }

    #[test]
    fn test_run_record_serializes_flat_outcome() {
        let mut record = RunRecord::new("run-a", RunOutcome::Escalated);
        record.attempts = 3;
        record.reason = Some("permission-denied".into());
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["outcome"], "escalated");
        assert_eq!(value["reason"], "permission-denied");
        assert_eq!(value["attempts"], 3);
    }
}
