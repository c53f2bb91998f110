//! Timing configuration for supervised execution.
//!
//! Holds every wall-clock limit the supervisor enforces: how long a single
//! executor dispatch may run, how long an approval request may stay pending,
//! how often the approval mailbox and timeout sweep run, and how long a git
//! worktree command may take.

use std::time::Duration;

/// Configuration for timeout behavior during supervised execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time allowed for one executor dispatch.
    /// Default: 7200 seconds (2 hours)
    pub executor_timeout: Duration,

    /// Age after which a pending approval request transitions to `timeout`.
    /// Default: 86400 seconds (24 hours)
    pub approval_timeout: Duration,

    /// Interval between background sweeps for expired approval requests.
    /// Default: 60 seconds
    pub approval_sweep_interval: Duration,

    /// Interval between reads of the approval mailbox directory.
    /// Default: 2 seconds
    pub mailbox_poll_interval: Duration,

    /// Maximum time allowed for a single git command (worktree add/remove).
    /// Default: 60 seconds
    pub git_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            executor_timeout: Duration::from_secs(7200),
            approval_timeout: Duration::from_secs(86_400),
            approval_sweep_interval: Duration::from_secs(60),
            mailbox_poll_interval: Duration::from_secs(2),
            git_timeout: Duration::from_secs(60),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the executor dispatch timeout.
    pub fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = timeout;
        self
    }

    /// Sets the approval timeout.
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    /// Sets the interval of the approval timeout sweep.
    pub fn with_approval_sweep_interval(mut self, interval: Duration) -> Self {
        self.approval_sweep_interval = interval;
        self
    }

    /// Sets the approval mailbox poll interval.
    pub fn with_mailbox_poll_interval(mut self, interval: Duration) -> Self {
        self.mailbox_poll_interval = interval;
        self
    }

    /// Sets the git command timeout.
    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_executor_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.executor_timeout, Duration::from_secs(7200));
    }

    #[test]
    fn test_default_approval_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.approval_timeout, Duration::from_secs(86_400));
    }

    #[test]
    fn test_default_polling_intervals() {
        let config = TimeoutConfig::default();
        assert_eq!(config.approval_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.mailbox_poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_default_git_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.git_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_new_returns_default() {
        assert_eq!(TimeoutConfig::new(), TimeoutConfig::default());
    }

    #[test]
    fn test_builder_pattern() {
        let config = TimeoutConfig::new()
            .with_executor_timeout(Duration::from_secs(300))
            .with_approval_timeout(Duration::from_millis(50))
            .with_approval_sweep_interval(Duration::from_millis(10))
            .with_mailbox_poll_interval(Duration::from_millis(5))
            .with_git_timeout(Duration::from_secs(30));

        assert_eq!(config.executor_timeout, Duration::from_secs(300));
        assert_eq!(config.approval_timeout, Duration::from_millis(50));
        assert_eq!(config.approval_sweep_interval, Duration::from_millis(10));
        assert_eq!(config.mailbox_poll_interval, Duration::from_millis(5));
        assert_eq!(config.git_timeout, Duration::from_secs(30));
    }
}
