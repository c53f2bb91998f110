//! Layered settings.
//!
//! Sources, later ones winning: `warden.toml` in the project root (optional),
//! an explicit `--config` file, then `WARDEN_*` environment variables with
//! `__` separating nested keys (`WARDEN_EXECUTOR__COMMAND`,
//! `WARDEN_APPROVAL__TIMEOUT_SECS`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::retry::{RetryPolicy, RetryPolicyEngine};
use crate::timeout::TimeoutConfig;

pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";
pub const DEFAULT_STATE_DIR: &str = ".warden";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// State directory, relative to the project root unless absolute.
    pub state_dir: Option<PathBuf>,
    pub retry: RetrySettings,
    pub queue: QueueSettings,
    pub approval: ApprovalSettings,
    pub executor: ExecutorSettings,
    pub workspace: WorkspaceSettings,
    pub evidence: EvidenceSettings,
}

/// Override for one failure reason's retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub max_attempts: u32,
    #[serde(default)]
    pub base_backoff_secs: u64,
    #[serde(default)]
    pub max_backoff_secs: u64,
    #[serde(default = "default_true")]
    pub escalate: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Policy overrides keyed by failure reason (`unknown` replaces the fallback).
    pub policies: BTreeMap<String, PolicySettings>,
    /// Longest backoff waited out inside a session; longer ones are deferred.
    pub inline_backoff_ceiling_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            policies: BTreeMap::new(),
            inline_backoff_ceiling_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Age after which succeeded/abandoned queue items are purged by `cleanup`.
    pub retention_days: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub mailbox_poll_interval_ms: u64,
    /// Webhook receiving approval requests. Unset logs them instead.
    pub webhook_url: Option<String>,
    /// Address for the HTTP callback server, e.g. `127.0.0.1:8787`.
    pub callback_bind: Option<String>,
    /// Shared secret for `X-Warden-Signature` verification.
    pub callback_secret: Option<String>,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        let timeouts = TimeoutConfig::default();
        Self {
            timeout_secs: timeouts.approval_timeout.as_secs(),
            sweep_interval_secs: timeouts.approval_sweep_interval.as_secs(),
            mailbox_poll_interval_ms: timeouts.mailbox_poll_interval.as_millis() as u64,
            webhook_url: None,
            callback_bind: None,
            callback_secret: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Agent program spawned per attempt.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: TimeoutConfig::default().executor_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    pub base_branch: String,
    pub branch_prefix: String,
    pub git_timeout_secs: u64,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            base_branch: "HEAD".to_string(),
            branch_prefix: "warden".to_string(),
            git_timeout_secs: TimeoutConfig::default().git_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceSettings {
    /// Sessions older than this are pruned by `cleanup`. 0 keeps everything.
    pub retention_days: u64,
}

impl Default for EvidenceSettings {
    fn default() -> Self {
        Self {
            retention_days: crate::evidence::DEFAULT_RETENTION_DAYS,
        }
    }
}

impl WardenConfig {
    /// Load settings for `project_root`.
    ///
    /// A missing `warden.toml` is fine; a missing explicit file is not.
    pub fn load(project_root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::from(project_root.join(DEFAULT_CONFIG_FILE)).required(false));
        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("WARDEN")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("executor.args")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn state_dir(&self, project_root: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_root.join(dir),
            None => project_root.join(DEFAULT_STATE_DIR),
        }
    }

    /// Default policy table with the configured overrides applied.
    pub fn retry_engine(&self) -> RetryPolicyEngine {
        self.retry
            .policies
            .iter()
            .fold(RetryPolicyEngine::new(), |engine, (reason, p)| {
                engine.with_policy(
                    reason.clone(),
                    RetryPolicy::new(
                        p.max_attempts.max(1),
                        Duration::from_secs(p.base_backoff_secs),
                        Duration::from_secs(p.max_backoff_secs.max(p.base_backoff_secs)),
                        p.escalate,
                    ),
                )
            })
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig::new()
            .with_executor_timeout(Duration::from_secs(self.executor.timeout_secs))
            .with_approval_timeout(Duration::from_secs(self.approval.timeout_secs))
            .with_approval_sweep_interval(Duration::from_secs(self.approval.sweep_interval_secs))
            .with_mailbox_poll_interval(Duration::from_millis(self.approval.mailbox_poll_interval_ms))
            .with_git_timeout(Duration::from_secs(self.workspace.git_timeout_secs))
    }

    pub fn inline_backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.retry.inline_backoff_ceiling_secs)
    }
}

/// Paths inside the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    pub fn approvals_path(&self) -> PathBuf {
        self.root.join("approvals.json")
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.root.join("mailbox")
    }

    /// Storage handed to the executor: per run, or one shared directory.
    pub fn run_storage(&self, run_id: &str, per_run: bool) -> PathBuf {
        let runs = self.root.join("runs");
        if per_run {
            runs.join(run_id)
        } else {
            runs.join("shared")
        }
    }
}
