//! Per-run workspace isolation.
//!
//! Every run executes in a workspace it leases exclusively. The lease is a
//! record `leases/<run_id>.json` created atomically; a second lease for the
//! same run fails immediately instead of waiting. With `worktree` isolation
//! each lease also owns a git worktree at `worktrees/<run_id>` on the branch
//! `<prefix>/<run_id>`, so concurrent runs never share a checkout.

pub mod git;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fsutil;
use crate::lock::ProcessProbe;

pub use git::GitRunner;

/// Errors that can occur while leasing or releasing workspaces.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    /// The run already holds a lease.
    #[error("workspace for run {run_id} is already leased by pid {holder_pid}")]
    AlreadyLeased { run_id: String, holder_pid: u32 },

    /// The lease record belongs to another process.
    #[error("lease for run {run_id} is held by pid {holder_pid}, not this process")]
    NotHolder { run_id: String, holder_pid: u32 },

    /// The run identifier cannot be used as a path component.
    #[error("invalid run ID: {0:?}")]
    InvalidRunId(String),

    /// A git command exited unsuccessfully.
    #[error("git {args} failed: {stderr}")]
    Git { args: String, stderr: String },

    /// A git command did not finish in time.
    #[error("git {args} timed out after {timeout:?}")]
    GitTimeout { args: String, timeout: Duration },

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for workspace operations.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// How strongly concurrent runs are separated from each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Runs execute in the project checkout itself.
    #[default]
    #[serde(alias = "shared")]
    None,
    /// Each run gets a dedicated git worktree on its own branch.
    Worktree,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationLevel::None => write!(f, "none"),
            IsolationLevel::Worktree => write!(f, "worktree"),
        }
    }
}

/// Process that took a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasedBy {
    pub pid: u32,
    pub hostname: String,
}

/// An exclusive workspace lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub run_id: String,
    pub workspace_path: PathBuf,
    pub branch_name: Option<String>,
    pub isolation: IsolationLevel,
    pub leased_by: LeasedBy,
    pub leased_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

/// Summary of a [`WorkspaceIsolationManager::cleanup_all`] pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Runs whose lease was held by a dead process and has been reclaimed.
    pub reclaimed_leases: Vec<String>,
    /// Worktree directories with no lease record that were removed.
    pub orphaned_worktrees: Vec<PathBuf>,
    /// Leases left alone because their holder is alive.
    pub live_leases: Vec<String>,
}

/// Leases workspaces to runs.
#[derive(Debug, Clone)]
pub struct WorkspaceIsolationManager {
    project_root: PathBuf,
    leases_dir: PathBuf,
    worktrees_dir: PathBuf,
    isolation: IsolationLevel,
    base_branch: String,
    branch_prefix: String,
    git_timeout: Duration,
    probe: Arc<dyn ProcessProbe>,
}

impl WorkspaceIsolationManager {
    /// Create a manager for `project_root` keeping its records in `state_dir`.
    pub fn new(
        project_root: impl Into<PathBuf>,
        state_dir: &Path,
        isolation: IsolationLevel,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            leases_dir: state_dir.join("leases"),
            worktrees_dir: state_dir.join("worktrees"),
            isolation,
            base_branch: "HEAD".to_string(),
            branch_prefix: "warden".to_string(),
            git_timeout: Duration::from_secs(60),
            probe,
        }
    }

    pub fn with_base_branch(mut self, base_branch: impl Into<String>) -> Self {
        self.base_branch = base_branch.into();
        self
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn git(&self) -> GitRunner {
        GitRunner::new(&self.project_root).with_timeout(self.git_timeout)
    }

    fn lease_path(&self, run_id: &str) -> PathBuf {
        self.leases_dir.join(format!("{}.json", run_id))
    }

    /// Branch a run's worktree is checked out on.
    pub fn branch_name(&self, run_id: &str) -> String {
        format!("{}/{}", self.branch_prefix, run_id)
    }

    /// Lease a workspace for `run_id`.
    ///
    /// Fails with [`WorkspaceError::AlreadyLeased`] when a lease record exists.
    pub async fn lease(&self, run_id: &str) -> WorkspaceResult<Lease> {
        if !fsutil::is_safe_component(run_id) {
            return Err(WorkspaceError::InvalidRunId(run_id.to_string()));
        }
        fs::create_dir_all(&self.leases_dir)?;

        let (workspace_path, branch_name) = match self.isolation {
            IsolationLevel::None => (self.project_root.clone(), None),
            IsolationLevel::Worktree => (
                self.worktrees_dir.join(run_id),
                Some(self.branch_name(run_id)),
            ),
        };

        let lease = Lease {
            run_id: run_id.to_string(),
            workspace_path,
            branch_name,
            isolation: self.isolation,
            leased_by: LeasedBy {
                pid: std::process::id(),
                hostname: self.probe.hostname(),
            },
            leased_at: Utc::now(),
            released_at: None,
        };

        let record_path = self.lease_path(run_id);
        if !fsutil::create_json_exclusive(&record_path, &lease)? {
            let holder_pid = fsutil::read_json::<Lease>(&record_path)
                .ok()
                .flatten()
                .map(|l| l.leased_by.pid)
                .unwrap_or(0);
            return Err(WorkspaceError::AlreadyLeased {
                run_id: run_id.to_string(),
                holder_pid,
            });
        }

        if let Some(branch) = &lease.branch_name {
            if let Err(err) = self.create_worktree(&lease.workspace_path, branch).await {
                let _ = fsutil::remove_if_exists(&record_path);
                return Err(err);
            }
        }

        info!(
            run_id,
            path = %lease.workspace_path.display(),
            isolation = %lease.isolation,
            "Workspace leased"
        );
        Ok(lease)
    }

    async fn create_worktree(&self, path: &Path, branch: &str) -> WorkspaceResult<()> {
        fs::create_dir_all(&self.worktrees_dir)?;
        if path.exists() {
            debug!(path = %path.display(), "Removing leftover worktree directory");
            self.remove_worktree(path).await;
        }
        self.git()
            .worktree_add(path, branch, &self.base_branch)
            .await?;
        debug!(path = %path.display(), branch, "Created worktree");
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) {
        if let Err(e) = self.git().worktree_remove(path).await {
            debug!(path = %path.display(), error = %e, "Git worktree remove failed, using force remove");
            if path.exists() {
                if let Err(e) = fs::remove_dir_all(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove worktree directory");
                }
            }
            let _ = self.git().worktree_prune().await;
        }
    }

    /// Release the lease held by this process for `run_id`.
    ///
    /// Removes the worktree (the run branch is kept) and the lease record.
    /// Returns the released lease, or `None` if no lease existed.
    pub async fn release(&self, run_id: &str) -> WorkspaceResult<Option<Lease>> {
        if !fsutil::is_safe_component(run_id) {
            return Err(WorkspaceError::InvalidRunId(run_id.to_string()));
        }
        let record_path = self.lease_path(run_id);
        let Some(mut lease) = fsutil::read_json::<Lease>(&record_path)? else {
            return Ok(None);
        };
        if lease.leased_by.pid != std::process::id() {
            return Err(WorkspaceError::NotHolder {
                run_id: run_id.to_string(),
                holder_pid: lease.leased_by.pid,
            });
        }

        self.discard(&lease).await?;
        lease.released_at = Some(Utc::now());
        info!(run_id, "Workspace released");
        Ok(Some(lease))
    }

    async fn discard(&self, lease: &Lease) -> WorkspaceResult<()> {
        if lease.isolation == IsolationLevel::Worktree {
            self.remove_worktree(&lease.workspace_path).await;
        }
        fsutil::remove_if_exists(&self.lease_path(&lease.run_id))?;
        Ok(())
    }

    /// Every lease record currently on disk, ordered by run ID.
    pub fn list_leases(&self) -> WorkspaceResult<Vec<Lease>> {
        let entries = match fs::read_dir(&self.leases_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut leases = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fsutil::read_json::<Lease>(&path) {
                Ok(Some(lease)) => leases.push(lease),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Unreadable lease record"),
            }
        }
        leases.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(leases)
    }

    /// Whether the process holding `lease` is verified dead.
    pub fn is_orphaned(&self, lease: &Lease) -> bool {
        !self
            .probe
            .holder_alive(lease.leased_by.pid, &lease.leased_by.hostname)
    }

    /// Reclaim leases of dead holders and remove unleased worktrees.
    pub async fn cleanup_all(&self) -> WorkspaceResult<CleanupReport> {
        let mut report = CleanupReport::default();

        let leases = self.list_leases()?;
        for lease in &leases {
            if self.is_orphaned(lease) {
                warn!(run_id = %lease.run_id, dead_pid = lease.leased_by.pid, "Reclaiming orphaned lease");
                self.discard(lease).await?;
                report.reclaimed_leases.push(lease.run_id.clone());
            } else {
                report.live_leases.push(lease.run_id.clone());
            }
        }

        if self.worktrees_dir.exists() {
            for entry in fs::read_dir(&self.worktrees_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if report.live_leases.contains(&name) {
                    continue;
                }
                let path = entry.path();
                warn!(path = %path.display(), "Cleaning up orphaned worktree");
                self.remove_worktree(&path).await;
                report.orphaned_worktrees.push(path);
            }
        }

        Ok(report)
    }
}
