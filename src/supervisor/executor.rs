//! Build executor contract and the command-spawning adapter.
//!
//! The agent doing the actual work is external. `warden` hands it a
//! workspace path and a [`WorkItem`], and gets an [`ExecutionReport`] back.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::retry::{classify_failure, reasons};

/// What an executor is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub run_id: String,
    /// 1-based attempt number, counting attempts from earlier sessions.
    pub attempt: u32,
    /// Storage directory for this run's artifacts.
    pub storage_dir: PathBuf,
    /// Risky action types a human has approved for this run.
    pub approved_actions: Vec<String>,
    pub anchor_path: PathBuf,
}

/// A risky action the executor wants to take, pending human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalNeed {
    pub action_type: String,
    #[serde(default)]
    pub decision_info: serde_json::Value,
    /// Paths the action would touch.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Result of one executor attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    /// Failure reason key. Unknown keys are treated as `unknown`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_required: Option<ApprovalNeed>,
}

impl ExecutionReport {
    pub fn success() -> Self {
        Self {
            success: true,
            failure_reason: None,
            message: None,
            approval_required: None,
        }
    }

    pub fn failure(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason.into()),
            message: Some(message.into()),
            approval_required: None,
        }
    }

    /// The executor stopped before a risky action and asks for approval.
    pub fn needs_approval(need: ApprovalNeed) -> Self {
        Self {
            success: false,
            failure_reason: None,
            message: None,
            approval_required: Some(need),
        }
    }
}

/// Black-box build agent.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn execute(&self, workspace: &Path, item: &WorkItem) -> ExecutionReport;
}

/// Runs an external command per attempt.
///
/// The command gets the work item through `WARDEN_*` environment variables.
/// If the last non-empty stdout line is a JSON [`ExecutionReport`] it is used
/// as the result; otherwise the exit status decides and stderr is classified.
#[derive(Debug, Clone)]
pub struct CommandBuildExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBuildExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, workspace: &Path, item: &WorkItem) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(workspace)
            .env("WARDEN_RUN_ID", &item.run_id)
            .env("WARDEN_ATTEMPT", item.attempt.to_string())
            .env("WARDEN_WORKSPACE", workspace)
            .env("WARDEN_STORAGE_DIR", &item.storage_dir)
            .env("WARDEN_ANCHOR_PATH", &item.anchor_path)
            .env("WARDEN_APPROVED_ACTIONS", item.approved_actions.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl BuildExecutor for CommandBuildExecutor {
    async fn execute(&self, workspace: &Path, item: &WorkItem) -> ExecutionReport {
        debug!(
            run_id = %item.run_id,
            attempt = item.attempt,
            program = %self.program,
            "Spawning executor"
        );

        let output = match tokio::time::timeout(
            self.timeout,
            self.command(workspace, item).output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(run_id = %item.run_id, error = %err, "Failed to spawn executor");
                let message = format!("failed to spawn {}: {}", self.program, err);
                return ExecutionReport::failure(classify_failure(&message), message);
            }
            Err(_) => {
                return ExecutionReport::failure(
                    reasons::EXECUTOR_TIMEOUT,
                    format!("executor exceeded {}s", self.timeout.as_secs()),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        report_from_output(output.status.success(), &stdout, &stderr)
    }
}

fn report_from_output(exit_ok: bool, stdout: &str, stderr: &str) -> ExecutionReport {
    let reported = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str::<ExecutionReport>(line.trim()).ok());

    match reported {
        // A zero exit is required for a reported success to count.
        Some(report) if report.success && !exit_ok => {
            let message = tail(stderr);
            ExecutionReport::failure(classify_failure(&message), message)
        }
        Some(report) => report,
        None if exit_ok => ExecutionReport::success(),
        None => {
            let message = tail(stderr);
            ExecutionReport::failure(classify_failure(&message), message)
        }
    }
}

/// Last few lines of a stream, for error messages.
fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(dir: &Path) -> WorkItem {
        WorkItem {
            run_id: "run-1".to_string(),
            attempt: 1,
            storage_dir: dir.to_path_buf(),
            approved_actions: vec![],
            anchor_path: dir.join("anchor.toml"),
        }
    }

    #[test]
    fn test_report_from_output_prefers_json_line() {
        let stdout = "working...\n{\"success\":false,\"failure_reason\":\"transient-lock\"}\n";
        let report = report_from_output(false, stdout, "");
        assert!(!report.success);
        assert_eq!(report.failure_reason.as_deref(), Some("transient-lock"));
    }

    #[test]
    fn test_report_from_output_classifies_stderr() {
        let report = report_from_output(false, "", "error: Permission denied (os error 13)\n");
        assert_eq!(report.failure_reason.as_deref(), Some(reasons::PERMISSION_DENIED));
    }

    #[test]
    fn test_report_from_output_rejects_success_with_bad_exit() {
        let report = report_from_output(false, "{\"success\":true}", "boom");
        assert!(!report.success);
        assert_eq!(report.failure_reason.as_deref(), Some(reasons::UNKNOWN));
    }

    #[test]
    fn test_report_from_output_carries_approval_need() {
        let stdout = r#"{"success":false,"approval_required":{"action_type":"push","paths":["main"]}}"#;
        let report = report_from_output(true, stdout, "");
        let need = report.approval_required.expect("approval need");
        assert_eq!(need.action_type, "push");
        assert_eq!(need.paths, vec!["main".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_success_and_env() {
        let temp_dir = TempDir::new().expect("temp dir");
        let executor = CommandBuildExecutor::new("sh").with_args(vec![
            "-c".to_string(),
            "test \"$WARDEN_RUN_ID\" = run-1".to_string(),
        ]);

        let report = executor.execute(temp_dir.path(), &item(temp_dir.path())).await;
        assert!(report.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_timeout() {
        let temp_dir = TempDir::new().expect("temp dir");
        let executor = CommandBuildExecutor::new("sleep")
            .with_args(vec!["5".to_string()])
            .with_timeout(Duration::from_millis(100));

        let report = executor.execute(temp_dir.path(), &item(temp_dir.path())).await;
        assert_eq!(report.failure_reason.as_deref(), Some(reasons::EXECUTOR_TIMEOUT));
    }

    #[tokio::test]
    async fn test_command_executor_missing_program() {
        let temp_dir = TempDir::new().expect("temp dir");
        let executor = CommandBuildExecutor::new("warden-no-such-agent-binary");

        let report = executor.execute(temp_dir.path(), &item(temp_dir.path())).await;
        assert!(!report.success);
        assert!(report.message.unwrap_or_default().contains("failed to spawn"));
    }
}
