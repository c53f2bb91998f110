//! The anchor: a declared intent bounding what supervised runs may do.
//!
//! An anchor names the paths work may touch, the paths it must never touch,
//! attempt and time budgets, and the parallelism policy. It is read once per
//! session and never changes while the session runs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::workspace::IsolationLevel;

/// Errors that can occur while loading an anchor.
#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("anchor not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to read anchor {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse anchor {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid anchor: {0}")]
    Invalid(String),
}

/// Result type for anchor loading.
pub type AnchorResult<T> = Result<T, AnchorError>;

/// Declared intent for a supervision session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Anchor {
    /// Glob patterns of paths runs are allowed to modify. Empty means unrestricted.
    pub allowed_paths: Vec<String>,
    /// Glob patterns of paths no automated action may touch.
    pub protected_paths: Vec<String>,
    pub budgets: Budgets,
    pub parallelism: ParallelismPolicy,
}

/// Session-wide limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Budgets {
    /// Upper bound on executor attempts for any one run, tighter than the retry policy.
    pub max_attempts_per_run: Option<u32>,
    /// Wall-clock limit for the whole session; no run starts after it elapses.
    pub max_session_secs: Option<u64>,
}

/// Whether and how runs may execute concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ParallelismPolicy {
    pub allowed: bool,
    pub max_concurrent_runs: u32,
    pub isolation_level: IsolationLevel,
}

impl Default for ParallelismPolicy {
    fn default() -> Self {
        Self {
            allowed: false,
            max_concurrent_runs: 1,
            isolation_level: IsolationLevel::None,
        }
    }
}

/// An anchor together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedAnchor {
    pub anchor: Anchor,
    pub path: PathBuf,
    /// Hex SHA-256 of the file bytes.
    pub digest: String,
}

impl Anchor {
    /// Load an anchor from a JSON or TOML file (chosen by extension).
    pub fn load(path: &Path) -> AnchorResult<LoadedAnchor> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AnchorError::Missing(path.to_path_buf()))
            }
            Err(source) => {
                return Err(AnchorError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let digest = hex::encode(Sha256::digest(&bytes));
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

        let anchor = if is_toml {
            let text = String::from_utf8_lossy(&bytes);
            toml::from_str::<Anchor>(&text).map_err(|e| AnchorError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_json::from_slice::<Anchor>(&bytes).map_err(|e| AnchorError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        anchor.validate()?;
        debug!(path = %path.display(), digest = %digest, "Anchor loaded");

        Ok(LoadedAnchor {
            anchor,
            path: path.to_path_buf(),
            digest,
        })
    }

    /// Check internal consistency.
    pub fn validate(&self) -> AnchorResult<()> {
        if self.parallelism.max_concurrent_runs == 0 {
            return Err(AnchorError::Invalid(
                "parallelism.max_concurrent_runs must be at least 1".into(),
            ));
        }
        if self.budgets.max_attempts_per_run == Some(0) {
            return Err(AnchorError::Invalid(
                "budgets.max_attempts_per_run must be at least 1".into(),
            ));
        }
        for pattern in self.allowed_paths.iter().chain(&self.protected_paths) {
            glob::Pattern::new(pattern)
                .map_err(|e| AnchorError::Invalid(format!("bad path pattern {:?}: {}", pattern, e)))?;
        }
        Ok(())
    }

    /// JSON schema of the anchor document.
    pub fn schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Anchor)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_anchor() {
        let temp_dir = TempDir::new().expect("temp dir");
        let err = Anchor::load(&temp_dir.path().join("anchor.json")).expect_err("missing");
        assert!(matches!(err, AnchorError::Missing(_)));
    }

    #[test]
    fn test_defaults_forbid_parallelism() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("anchor.json");
        fs::write(&path, "{}").expect("write");

        let loaded = Anchor::load(&path).expect("load");

        assert!(!loaded.anchor.parallelism.allowed);
        assert_eq!(loaded.anchor.parallelism.max_concurrent_runs, 1);
        assert_eq!(loaded.digest.len(), 64);
    }

    #[test]
    fn test_load_toml() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("anchor.toml");
        fs::write(
            &path,
            r#"
protected_paths = ["secrets/**"]

[budgets]
max_attempts_per_run = 4

[parallelism]
allowed = true
max_concurrent_runs = 3
isolation_level = "worktree"
"#,
        )
        .expect("write");

        let anchor = Anchor::load(&path).expect("load").anchor;

        assert!(anchor.parallelism.allowed);
        assert_eq!(anchor.parallelism.max_concurrent_runs, 3);
        assert_eq!(anchor.parallelism.isolation_level, IsolationLevel::Worktree);
        assert_eq!(anchor.budgets.max_attempts_per_run, Some(4));
        assert_eq!(anchor.protected_paths, vec!["secrets/**".to_string()]);
    }

    #[test]
    fn test_malformed_anchor_is_parse_error() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("anchor.json");
        fs::write(&path, "{not json").expect("write");

        assert!(matches!(Anchor::load(&path), Err(AnchorError::Parse { .. })));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("anchor.json");
        fs::write(&path, r#"{"parallelism": {"max_concurrent_runs": 0}}"#).expect("write");

        assert!(matches!(Anchor::load(&path), Err(AnchorError::Invalid(_))));
    }

    #[test]
    fn test_schema_names_parallelism() {
        let schema = Anchor::schema();
        assert!(schema.to_string().contains("max_concurrent_runs"));
    }
}
