//! Policy checks applied before any run is dispatched.

use std::fmt;

use glob::Pattern;
use serde::Serialize;

use crate::anchor::Anchor;
use crate::workspace::IsolationLevel;

/// Result of a governance check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Deny(String),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// Evaluates an anchor's parallelism policy.
///
/// A denial is final for the session: the requested worker count is never
/// quietly reduced to fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct GovernanceGate;

impl GovernanceGate {
    pub fn check(&self, anchor: &Anchor, requested_workers: u32) -> GateDecision {
        if requested_workers == 0 {
            return GateDecision::Deny("at least one worker is required".into());
        }
        if requested_workers == 1 {
            return GateDecision::Allow;
        }

        let policy = &anchor.parallelism;
        if !policy.allowed {
            return GateDecision::Deny(format!(
                "{} workers requested but the anchor does not allow parallel execution",
                requested_workers
            ));
        }
        if requested_workers > policy.max_concurrent_runs {
            return GateDecision::Deny(format!(
                "{} workers requested but the anchor allows at most {}",
                requested_workers, policy.max_concurrent_runs
            ));
        }
        if policy.isolation_level != IsolationLevel::Worktree {
            return GateDecision::Deny(format!(
                "parallel execution requires isolation_level = worktree, anchor has {}",
                policy.isolation_level
            ));
        }
        GateDecision::Allow
    }

    /// Size of the worker pool for an allowed request.
    pub fn effective_workers(&self, anchor: &Anchor, requested_workers: u32) -> usize {
        requested_workers
            .min(anchor.parallelism.max_concurrent_runs)
            .max(1) as usize
    }
}

/// Compiled set of protected path patterns.
#[derive(Clone, Default)]
pub struct ProtectedPaths {
    patterns: Vec<Pattern>,
}

impl fmt::Debug for ProtectedPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.patterns.iter().map(|p| p.as_str()))
            .finish()
    }
}

impl ProtectedPaths {
    /// Compile `patterns`, skipping any that are not valid globs.
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter_map(|p| Pattern::new(p.trim_end_matches('/')).ok())
                .collect(),
        }
    }

    pub fn from_anchor(anchor: &Anchor) -> Self {
        Self::new(&anchor.protected_paths)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `path` (relative to the project root) is protected.
    ///
    /// A pattern also protects everything beneath a matching directory.
    pub fn matches(&self, path: &str) -> bool {
        let normalized = path.trim_start_matches("./").replace('\\', "/");
        self.patterns.iter().any(|pattern| {
            if pattern.matches(&normalized) {
                return true;
            }
            let mut prefix = normalized.as_str();
            while let Some(idx) = prefix.rfind('/') {
                prefix = &prefix[..idx];
                if pattern.matches(prefix) {
                    return true;
                }
            }
            false
        })
    }

    /// Every protected path among `paths`.
    pub fn filter<'a>(&self, paths: &'a [String]) -> Vec<&'a str> {
        paths
            .iter()
            .map(String::as_str)
            .filter(|p| self.matches(p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::ParallelismPolicy;

    fn anchor(allowed: bool, max: u32, isolation: IsolationLevel) -> Anchor {
        Anchor {
            parallelism: ParallelismPolicy {
                allowed,
                max_concurrent_runs: max,
                isolation_level: isolation,
            },
            ..Anchor::default()
        }
    }

    #[test]
    fn test_denies_parallel_when_not_allowed() {
        let gate = GovernanceGate;
        let decision = gate.check(&anchor(false, 5, IsolationLevel::Worktree), 3);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_denies_above_max_concurrency() {
        let gate = GovernanceGate;
        let decision = gate.check(&anchor(true, 3, IsolationLevel::Worktree), 5);
        assert!(matches!(decision, GateDecision::Deny(reason) if reason.contains("at most 3")));
    }

    #[test]
    fn test_single_worker_always_allowed() {
        let gate = GovernanceGate;
        assert!(gate.check(&anchor(false, 1, IsolationLevel::None), 1).is_allowed());
        assert!(gate.check(&Anchor::default(), 1).is_allowed());
    }

    #[test]
    fn test_parallel_requires_worktree_isolation() {
        let gate = GovernanceGate;
        assert!(!gate.check(&anchor(true, 4, IsolationLevel::None), 2).is_allowed());
        assert!(gate.check(&anchor(true, 4, IsolationLevel::Worktree), 2).is_allowed());
    }

    #[test]
    fn test_zero_workers_denied() {
        assert!(!GovernanceGate.check(&Anchor::default(), 0).is_allowed());
    }

    #[test]
    fn test_effective_workers() {
        let gate = GovernanceGate;
        assert_eq!(gate.effective_workers(&anchor(true, 3, IsolationLevel::Worktree), 2), 2);
        assert_eq!(gate.effective_workers(&Anchor::default(), 1), 1);
    }

    #[test]
    fn test_protected_paths_match_directories() {
        let protected = ProtectedPaths::new(&[
            "secrets/**".to_string(),
            ".github/".to_string(),
            "*.key".to_string(),
        ]);

        assert!(protected.matches("secrets/prod/db.env"));
        assert!(protected.matches(".github/workflows/ci.yml"));
        assert!(protected.matches("server.key"));
        assert!(protected.matches("./secrets/a"));
        assert!(!protected.matches("docs/readme.md"));
        assert!(ProtectedPaths::default().is_empty());
    }
}
