use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{WorkspaceError, WorkspaceResult};

/// Thin async wrapper over the `git` binary, scoped to one repository.
#[derive(Debug, Clone)]
pub struct GitRunner {
    working_dir: PathBuf,
    timeout: Duration,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(&self, args: &[&str]) -> WorkspaceResult<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.working_dir)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(WorkspaceError::GitTimeout {
                    args: args.join(" "),
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr.trim(), "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> WorkspaceResult<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            return Err(WorkspaceError::Git {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output)
    }

    pub async fn branch_exists(&self, branch: &str) -> WorkspaceResult<bool> {
        let output = self
            .run(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .await?;
        Ok(output.status.success())
    }

    /// Create a worktree at `path` on `branch`.
    ///
    /// A new branch is cut from `base`; an existing branch (left over from an
    /// earlier attempt) is checked out as is.
    pub async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> WorkspaceResult<()> {
        let path_str = path.to_string_lossy();
        if self.branch_exists(branch).await? {
            self.run_checked(&["worktree", "add", &path_str, branch]).await?;
        } else {
            self.run_checked(&["worktree", "add", "-b", branch, &path_str, base])
                .await?;
        }
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> WorkspaceResult<()> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path_str])
            .await?;
        Ok(())
    }

    pub async fn worktree_prune(&self) -> WorkspaceResult<()> {
        self.run_checked(&["worktree", "prune"]).await?;
        Ok(())
    }
}
