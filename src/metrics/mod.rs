//! Run metrics for supervision sessions.
//!
//! A [`SessionMetricsCollector`] is shared by every worker of a session and
//! records one [`RunAttemptMetrics`] entry per run. The finished
//! [`SessionMetrics`] snapshot is persisted by [`SessionMetricsStore`] and
//! included in evidence exports.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::fsutil;

/// Outcome labels that mean the run was never dispatched.
const SKIPPED_LABELS: &[&str] = &["already_running", "not_started"];

/// Metrics for a single run within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAttemptMetrics {
    /// Run identifier
    pub run_id: String,
    /// Executor attempts made during this session
    pub attempts: u32,
    /// Wall-clock time from lock acquisition to release
    pub duration: Duration,
    /// Terminal outcome label
    pub outcome: String,
    /// Failure reason of the last attempt, if any
    pub reason: Option<String>,
    /// Whether the run waited on a human approval
    pub awaited_approval: bool,
    pub started_at: std::time::SystemTime,
    pub completed_at: std::time::SystemTime,
}

impl RunAttemptMetrics {
    fn new(run_id: impl Into<String>) -> Self {
        let now = std::time::SystemTime::now();
        Self {
            run_id: run_id.into(),
            attempts: 0,
            duration: Duration::ZERO,
            outcome: "pending".to_string(),
            reason: None,
            awaited_approval: false,
            started_at: now,
            completed_at: now,
        }
    }

    fn is_skipped(&self) -> bool {
        SKIPPED_LABELS.contains(&self.outcome.as_str())
    }
}

/// Aggregated metrics for one supervision session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Session identifier
    pub session_id: String,
    pub started_at: std::time::SystemTime,
    pub completed_at: std::time::SystemTime,
    /// Total session duration
    pub session_duration: Duration,
    /// Size of the worker pool
    pub workers: u32,
    /// Runs that reached the executor at least once
    pub runs_dispatched: u32,
    pub runs_completed: u32,
    /// Runs handed to a human
    pub runs_escalated: u32,
    /// Runs skipped because of lock contention or a stop request
    pub runs_skipped: u32,
    /// Runs deferred to the pending action queue
    pub runs_retry_scheduled: u32,
    /// Runs that ended in any other failure
    pub runs_failed: u32,
    /// Executor attempts beyond the first, across runs
    pub retries: u32,
    /// Runs that waited on an approval
    pub approvals_requested: u32,
    /// Count of runs per outcome label
    pub outcomes: HashMap<String, u32>,
    /// Per-run details
    pub runs: Vec<RunAttemptMetrics>,
}

impl SessionMetrics {
    /// Fraction of dispatched runs that completed.
    pub fn success_rate(&self) -> f64 {
        if self.runs_dispatched == 0 {
            return 0.0;
        }
        self.runs_completed as f64 / self.runs_dispatched as f64
    }
}

#[derive(Debug)]
struct SessionMetricsState {
    session_id: String,
    workers: u32,
    started_at: std::time::SystemTime,
    started_instant: Instant,
    runs: HashMap<String, RunAttemptMetrics>,
}

/// Thread-safe session metrics collector.
#[derive(Debug, Clone)]
pub struct SessionMetricsCollector {
    inner: Arc<Mutex<SessionMetricsState>>,
}

impl SessionMetricsCollector {
    /// Create a collector for `session_id` with a pool of `workers`.
    pub fn new(session_id: impl Into<String>, workers: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionMetricsState {
                session_id: session_id.into(),
                workers,
                started_at: std::time::SystemTime::now(),
                started_instant: Instant::now(),
                runs: HashMap::new(),
            })),
        }
    }

    /// Record the start of a run.
    pub fn start_run(&self, run_id: &str) {
        if let Ok(mut state) = self.inner.lock() {
            state
                .runs
                .entry(run_id.to_string())
                .or_insert_with(|| RunAttemptMetrics::new(run_id));
        }
    }

    /// Record that a run is waiting on an approval.
    pub fn record_approval(&self, run_id: &str) {
        if let Ok(mut state) = self.inner.lock() {
            state
                .runs
                .entry(run_id.to_string())
                .or_insert_with(|| RunAttemptMetrics::new(run_id))
                .awaited_approval = true;
        }
    }

    /// Record the terminal outcome of a run.
    pub fn complete_run(
        &self,
        run_id: &str,
        outcome: &str,
        attempts: u32,
        duration: Duration,
        reason: Option<String>,
    ) {
        if let Ok(mut state) = self.inner.lock() {
            let entry = state
                .runs
                .entry(run_id.to_string())
                .or_insert_with(|| RunAttemptMetrics::new(run_id));
            entry.outcome = outcome.to_string();
            entry.attempts = attempts;
            entry.duration = duration;
            entry.reason = reason;
            entry.completed_at = std::time::SystemTime::now();
        }
    }

    /// Build a session metrics snapshot.
    pub fn finish(&self) -> SessionMetrics {
        let now = std::time::SystemTime::now();
        let Ok(state) = self.inner.lock() else {
            return SessionMetrics {
                session_id: "session-unknown".to_string(),
                started_at: now,
                completed_at: now,
                session_duration: Duration::ZERO,
                workers: 0,
                runs_dispatched: 0,
                runs_completed: 0,
                runs_escalated: 0,
                runs_skipped: 0,
                runs_retry_scheduled: 0,
                runs_failed: 0,
                retries: 0,
                approvals_requested: 0,
                outcomes: HashMap::new(),
                runs: Vec::new(),
            };
        };

        let count = |label: &str| state.runs.values().filter(|r| r.outcome == label).count() as u32;
        let runs_skipped = state.runs.values().filter(|r| r.is_skipped()).count() as u32;
        let runs_dispatched = state.runs.len() as u32 - runs_skipped;
        let runs_completed = count("completed");
        let runs_escalated = count("escalated");
        let runs_retry_scheduled = count("retry_scheduled");
        let runs_failed = runs_dispatched
            .saturating_sub(runs_completed)
            .saturating_sub(runs_escalated)
            .saturating_sub(runs_retry_scheduled);

        let mut outcomes = HashMap::new();
        for run in state.runs.values() {
            *outcomes.entry(run.outcome.clone()).or_insert(0) += 1;
        }

        let mut runs: Vec<RunAttemptMetrics> = state.runs.values().cloned().collect();
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));

        SessionMetrics {
            session_id: state.session_id.clone(),
            started_at: state.started_at,
            completed_at: now,
            session_duration: state.started_instant.elapsed(),
            workers: state.workers,
            runs_dispatched,
            runs_completed,
            runs_escalated,
            runs_skipped,
            runs_retry_scheduled,
            runs_failed,
            retries: state
                .runs
                .values()
                .map(|r| r.attempts.saturating_sub(1))
                .sum(),
            approvals_requested: state.runs.values().filter(|r| r.awaited_approval).count() as u32,
            outcomes,
            runs,
        }
    }
}

/// Store session metrics snapshots on disk.
#[derive(Debug, Clone)]
pub struct SessionMetricsStore {
    dir: PathBuf,
}

impl SessionMetricsStore {
    /// Create a store writing to `<state_dir>/metrics`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("metrics"),
        }
    }

    /// Save session metrics to disk.
    pub fn save(&self, metrics: &SessionMetrics) -> io::Result<PathBuf> {
        let path = self.dir.join(format!("{}.json", metrics.session_id));
        fsutil::write_json_atomic(&path, metrics)?;
        Ok(path)
    }

    /// Load session metrics from disk.
    pub fn load(&self, session_id: &str) -> io::Result<Option<SessionMetrics>> {
        fsutil::read_json(&self.dir.join(format!("{}.json", session_id)))
    }

    /// Delete the snapshot of a session.
    pub fn delete(&self, session_id: &str) -> io::Result<bool> {
        fsutil::remove_if_exists(&self.dir.join(format!("{}.json", session_id)))
    }
}

/// Format session metrics for display.
pub fn format_metrics(metrics: &SessionMetrics) -> String {
    let mut output = String::from("## Session Metrics\n\n");

    output.push_str("### Summary\n");
    output.push_str(&format!(
        "- **Runs Dispatched**: {} ({} completed, {} escalated, {} deferred, {} failed)\n",
        metrics.runs_dispatched,
        metrics.runs_completed,
        metrics.runs_escalated,
        metrics.runs_retry_scheduled,
        metrics.runs_failed
    ));
    output.push_str(&format!("- **Runs Skipped**: {}\n", metrics.runs_skipped));
    output.push_str(&format!(
        "- **Success Rate**: {:.1}%\n",
        metrics.success_rate() * 100.0
    ));
    output.push_str(&format!("- **Retries**: {}\n", metrics.retries));
    output.push_str(&format!("- **Workers**: {}\n", metrics.workers));
    output.push_str(&format!(
        "- **Session Time**: {:.1}s\n",
        metrics.session_duration.as_secs_f64()
    ));

    if !metrics.runs.is_empty() {
        output.push_str("\n### Runs\n");
        for run in &metrics.runs {
            output.push_str(&format!(
                "- **{}**: {} after {} attempt(s) in {:.1}s",
                run.run_id,
                run.outcome,
                run.attempts,
                run.duration.as_secs_f64()
            ));
            if let Some(reason) = &run.reason {
                output.push_str(&format!(" ({})", reason));
            }
            output.push('\n');
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_finish_aggregates_outcomes() {
        let collector = SessionMetricsCollector::new("session-1", 2);
        collector.start_run("run-a");
        collector.complete_run("run-a", "completed", 1, Duration::from_secs(2), None);
        collector.start_run("run-b");
        collector.complete_run(
            "run-b",
            "escalated",
            3,
            Duration::from_secs(5),
            Some("permission-denied".into()),
        );
        collector.complete_run("run-c", "already_running", 0, Duration::ZERO, None);

        let metrics = collector.finish();

        assert_eq!(metrics.runs_dispatched, 2);
        assert_eq!(metrics.runs_completed, 1);
        assert_eq!(metrics.runs_escalated, 1);
        assert_eq!(metrics.runs_skipped, 1);
        assert_eq!(metrics.runs_failed, 0);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.outcomes.get("completed"), Some(&1));
        assert_eq!(metrics.success_rate(), 0.5);
    }

    #[test]
    fn test_approval_flag() {
        let collector = SessionMetricsCollector::new("session-1", 1);
        collector.record_approval("run-a");
        collector.complete_run("run-a", "approval_rejected", 1, Duration::ZERO, None);

        let metrics = collector.finish();
        assert_eq!(metrics.approvals_requested, 1);
        assert_eq!(metrics.runs_failed, 1);
    }

    #[test]
    fn test_success_rate_with_nothing_dispatched() {
        let metrics = SessionMetricsCollector::new("session-1", 1).finish();
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn test_store_round_trip() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = SessionMetricsStore::new(temp_dir.path());
        let collector = SessionMetricsCollector::new("session-42", 1);
        collector.complete_run("run-a", "completed", 1, Duration::from_millis(10), None);

        let path = store.save(&collector.finish()).expect("save");

        assert!(path.ends_with("metrics/session-42.json"));
        let loaded = store.load("session-42").expect("load").expect("present");
        assert_eq!(loaded.runs_completed, 1);
        assert!(store.load("session-missing").expect("load").is_none());
    }

    #[test]
    fn test_format_metrics_lists_runs() {
        let collector = SessionMetricsCollector::new("session-1", 1);
        collector.complete_run(
            "run-a",
            "escalated",
            2,
            Duration::from_secs(1),
            Some("unknown".into()),
        );
        let text = format_metrics(&collector.finish());

        assert!(text.contains("## Session Metrics"));
        assert!(text.contains("**run-a**: escalated after 2 attempt(s)"));
        assert!(text.contains("(unknown)"));
    }
}
