//! Failure-reason keyed retry policy.
//!
//! [`RetryPolicyEngine::decide`] is a pure function of `(reason, attempt_count)`:
//! it returns whether a failed unit of work should be retried after a backoff,
//! escalated to a human, or abandoned. Every policy has a finite
//! `max_attempts`, so nothing retries forever.

mod classify;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use classify::classify_failure;

/// Failure reason keys with a built-in policy.
pub mod reasons {
    /// A file or resource is locked by another process.
    pub const TRANSIENT_LOCK: &str = "transient-lock";
    /// The OS refused access.
    pub const PERMISSION_DENIED: &str = "permission-denied";
    /// The same inputs will fail the same way again (e.g. target already exists).
    pub const DETERMINISTIC_COLLISION: &str = "deterministic-collision";
    /// The executor did not finish within its time limit.
    pub const EXECUTOR_TIMEOUT: &str = "executor-timeout";
    /// The action would touch a protected path.
    pub const PROTECTED_PATH: &str = "protected-path";
    /// Anything not recognised.
    pub const UNKNOWN: &str = "unknown";
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Retry limits for one failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed in total, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Whether exhausting the attempts hands the work to a human
    /// (`needs_manual`) instead of dropping it (`abandoned`).
    pub escalate_to_manual: bool,
}

impl RetryPolicy {
    pub const fn new(
        max_attempts: u32,
        base_backoff: Duration,
        max_backoff: Duration,
        escalate_to_manual: bool,
    ) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff,
            escalate_to_manual,
        }
    }

    /// Backoff before the attempt following `attempt_count` failures.
    ///
    /// `base * 2^(attempt_count - 1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.max(1) - 1;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_backoff)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Try again once `after` has elapsed.
    Retry {
        #[serde(with = "duration_secs")]
        after: Duration,
    },
    /// Stop and hand the work to a human.
    Escalate,
    /// Stop and drop the work.
    Abandon,
}

impl RetryDecision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RetryDecision::Retry { .. })
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Static table mapping failure reasons to retry policies.
#[derive(Debug, Clone)]
pub struct RetryPolicyEngine {
    policies: HashMap<String, RetryPolicy>,
    fallback: RetryPolicy,
}

impl Default for RetryPolicyEngine {
    fn default() -> Self {
        let mins = |m: u64| Duration::from_secs(m * MINUTE);
        let hours = |h: u64| Duration::from_secs(h * HOUR);

        let mut policies = HashMap::new();
        policies.insert(
            reasons::TRANSIENT_LOCK.to_string(),
            RetryPolicy::new(10, mins(5), hours(24), false),
        );
        policies.insert(
            reasons::PERMISSION_DENIED.to_string(),
            RetryPolicy::new(3, mins(1), mins(5), true),
        );
        policies.insert(
            reasons::DETERMINISTIC_COLLISION.to_string(),
            RetryPolicy::new(1, Duration::ZERO, Duration::ZERO, true),
        );
        policies.insert(
            reasons::EXECUTOR_TIMEOUT.to_string(),
            RetryPolicy::new(3, mins(1), mins(10), true),
        );
        policies.insert(
            reasons::PROTECTED_PATH.to_string(),
            RetryPolicy::new(1, Duration::ZERO, Duration::ZERO, true),
        );

        Self {
            policies,
            fallback: RetryPolicy::new(5, mins(10), hours(2), true),
        }
    }
}

impl RetryPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace or add the policy for `reason`. `unknown` replaces the fallback.
    pub fn with_policy(mut self, reason: impl Into<String>, policy: RetryPolicy) -> Self {
        let reason = reason.into();
        if reason == reasons::UNKNOWN {
            self.fallback = policy;
        } else {
            self.policies.insert(reason, policy);
        }
        self
    }

    /// Policy applied to `reason`, falling back to the `unknown` policy.
    pub fn policy_for(&self, reason: &str) -> &RetryPolicy {
        self.policies.get(reason).unwrap_or(&self.fallback)
    }

    /// Whether `reason` has its own policy.
    pub fn is_known(&self, reason: &str) -> bool {
        reason == reasons::UNKNOWN || self.policies.contains_key(reason)
    }

    /// Map a reported reason onto a policy key; unrecognised reasons become `unknown`.
    pub fn normalize_reason(&self, reason: &str) -> String {
        let trimmed = reason.trim();
        if self.is_known(trimmed) {
            trimmed.to_string()
        } else {
            reasons::UNKNOWN.to_string()
        }
    }

    /// Decide what happens after `attempt_count` failed attempts for `reason`.
    pub fn decide(&self, reason: &str, attempt_count: u32) -> RetryDecision {
        let policy = self.policy_for(reason);
        if attempt_count >= policy.max_attempts {
            return if policy.escalate_to_manual {
                RetryDecision::Escalate
            } else {
                RetryDecision::Abandon
            };
        }
        RetryDecision::Retry {
            after: policy.backoff_for(attempt_count),
        }
    }
}
