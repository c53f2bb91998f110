//! Durable queue of deferred and retryable work.
//!
//! Items are file moves blocked by OS-level conditions and supervised runs
//! whose retry backoff is too long to wait out in-session. The queue is a
//! single JSON array rewritten atomically on every mutation. Each failure
//! re-consults the [`RetryPolicyEngine`], so an item is always either
//! scheduled for a bounded retry or in a terminal status.
//!
//! The store serialises writers within one process only; two processes
//! mutating the same queue file at once can lose an update.

mod apply;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fsutil;
use crate::retry::{RetryDecision, RetryPolicyEngine};

pub use apply::{ActionApplier, ApplyFailure, FileMoveApplier};

/// Errors that can occur during queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// No item with this ID.
    #[error("queue item not found: {0}")]
    NotFound(String),

    /// The item is terminal and cannot change status again.
    #[error("queue item {id} is already {status}")]
    Terminal { id: String, status: QueueStatus },

    /// IO error while reading or writing the queue file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// What a queue item asks to be done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Rename `source` to `destination`.
    FileMove,
    /// Re-run the supervised run named by `source`.
    Run,
}

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Succeeded,
    Abandoned,
    NeedsManual,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, QueueStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Succeeded => "succeeded",
            QueueStatus::Abandoned => "abandoned",
            QueueStatus::NeedsManual => "needs_manual",
        }
    }

    /// Statuses that age-based cleanup may remove.
    pub fn is_purgeable(self) -> bool {
        matches!(self, QueueStatus::Succeeded | QueueStatus::Abandoned)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deferred unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub kind: ItemKind,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub reason: String,
    pub attempt_count: u32,
    pub status: QueueStatus,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Whether the item should be retried at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }

    fn apply_decision(&mut self, decision: RetryDecision, now: DateTime<Utc>) {
        self.updated_at = now;
        match decision {
            RetryDecision::Retry { after } => {
                self.status = QueueStatus::Pending;
                self.next_retry_at = Some(now + to_chrono(after));
            }
            RetryDecision::Escalate => {
                self.status = QueueStatus::NeedsManual;
                self.next_retry_at = None;
            }
            RetryDecision::Abandon => {
                self.status = QueueStatus::Abandoned;
                self.next_retry_at = None;
            }
        }
    }
}

/// Work to enqueue, before it gets an ID and a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub kind: ItemKind,
    pub source: String,
    pub destination: Option<String>,
}

impl NewItem {
    pub fn file_move(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::FileMove,
            source: source.into(),
            destination: Some(destination.into()),
        }
    }

    pub fn run(run_id: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Run,
            source: run_id.into(),
            destination: None,
        }
    }
}

/// Counts from one [`PendingActionQueue::process_due`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub succeeded: usize,
    pub rescheduled: usize,
    pub needs_manual: usize,
    pub abandoned: usize,
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// File-backed pending action queue.
#[derive(Debug)]
pub struct PendingActionQueue {
    path: PathBuf,
    engine: RetryPolicyEngine,
    write_guard: Mutex<()>,
}

impl PendingActionQueue {
    pub fn new(path: impl Into<PathBuf>, engine: RetryPolicyEngine) -> Self {
        Self {
            path: path.into(),
            engine,
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn engine(&self) -> &RetryPolicyEngine {
        &self.engine
    }

    fn load(&self) -> QueueResult<Vec<QueueItem>> {
        Ok(fsutil::read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&self, items: &[QueueItem]) -> QueueResult<()> {
        fsutil::write_json_atomic(&self.path, &items)?;
        Ok(())
    }

    /// Run `f` against the stored items and persist the result.
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<QueueItem>) -> QueueResult<T>) -> QueueResult<T> {
        let _guard = self.write_guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut items = self.load()?;
        let out = f(&mut items)?;
        self.save(&items)?;
        Ok(out)
    }

    fn next_id(items: &[QueueItem], now: DateTime<Utc>) -> String {
        let taken: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();
        let base = now.timestamp_millis();
        let mut n = 0u32;
        loop {
            let id = format!("q-{}-{}", base, n);
            if !taken.contains(id.as_str()) {
                return id;
            }
            n += 1;
        }
    }

    /// Enqueue work whose first attempt failed with `reason`.
    pub fn enqueue(
        &self,
        item: NewItem,
        reason: &str,
        last_error: Option<String>,
    ) -> QueueResult<QueueItem> {
        let reason = self.engine.normalize_reason(reason);
        let decision = self.engine.decide(&reason, 1);
        self.enqueue_decided(item, &reason, 1, decision, last_error)
    }

    /// Enqueue work with an attempt count and decision made by the caller.
    pub fn enqueue_decided(
        &self,
        item: NewItem,
        reason: &str,
        attempt_count: u32,
        decision: RetryDecision,
        last_error: Option<String>,
    ) -> QueueResult<QueueItem> {
        let now = Utc::now();
        let created = self.mutate(|items| {
            let mut queued = QueueItem {
                id: Self::next_id(items, now),
                kind: item.kind,
                source: item.source,
                destination: item.destination,
                reason: reason.to_string(),
                attempt_count,
                status: QueueStatus::Pending,
                enqueued_at: now,
                updated_at: now,
                next_retry_at: None,
                last_error,
            };
            queued.apply_decision(decision, now);
            items.push(queued.clone());
            Ok(queued)
        })?;

        info!(
            id = %created.id,
            source = %created.source,
            reason = %created.reason,
            attempt = created.attempt_count,
            status = %created.status,
            "Queue item enqueued"
        );
        Ok(created)
    }

    /// Record another failed attempt of a pending item and re-decide its fate.
    pub fn record_failure(
        &self,
        id: &str,
        reason: &str,
        last_error: Option<String>,
    ) -> QueueResult<QueueItem> {
        let reason = self.engine.normalize_reason(reason);
        let now = Utc::now();
        let updated = self.mutate(|items| {
            let item = pending_mut(items, id)?;
            let attempt_count = item.attempt_count.saturating_add(1);
            let decision = self.engine.decide(&reason, attempt_count);
            item.reason = reason.clone();
            item.attempt_count = attempt_count;
            item.last_error = last_error;
            item.apply_decision(decision, now);
            Ok(item.clone())
        })?;

        debug!(
            id,
            reason = %reason,
            attempt = updated.attempt_count,
            status = %updated.status,
            "Queue item failed again"
        );
        Ok(updated)
    }

    /// Overwrite a pending item's attempt count and schedule.
    pub fn record_outcome(
        &self,
        id: &str,
        reason: &str,
        attempt_count: u32,
        decision: RetryDecision,
        last_error: Option<String>,
    ) -> QueueResult<QueueItem> {
        let now = Utc::now();
        let updated = self.mutate(|items| {
            let item = pending_mut(items, id)?;
            item.reason = reason.to_string();
            item.attempt_count = attempt_count;
            item.last_error = last_error;
            item.apply_decision(decision, now);
            Ok(item.clone())
        })?;

        debug!(
            id,
            reason,
            attempt = attempt_count,
            status = %updated.status,
            "Queue item updated"
        );
        Ok(updated)
    }

    /// Mark a pending item as done.
    pub fn mark_succeeded(&self, id: &str) -> QueueResult<QueueItem> {
        let now = Utc::now();
        self.mutate(|items| {
            let item = pending_mut(items, id)?;
            item.status = QueueStatus::Succeeded;
            item.next_retry_at = None;
            item.updated_at = now;
            Ok(item.clone())
        })
    }

    /// Pending items whose retry time has come.
    pub fn eligible_for_retry(&self, now: DateTime<Utc>) -> QueueResult<Vec<QueueItem>> {
        Ok(self.load()?.into_iter().filter(|i| i.is_due(now)).collect())
    }

    /// Remove terminal items last updated more than `max_age` ago.
    ///
    /// Only `succeeded` and `abandoned` items are ever removed, even if other
    /// statuses are requested. Returns the number of removed items.
    pub fn cleanup_old_items(&self, max_age: Duration, statuses: &[QueueStatus]) -> QueueResult<usize> {
        let cutoff = Utc::now() - to_chrono(max_age);
        let removed = self.mutate(|items| {
            let before = items.len();
            items.retain(|item| {
                let purge = item.status.is_purgeable()
                    && statuses.contains(&item.status)
                    && item.updated_at < cutoff;
                !purge
            });
            Ok(before - items.len())
        })?;
        if removed > 0 {
            info!(removed, "Purged old queue items");
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> QueueResult<Option<QueueItem>> {
        Ok(self.load()?.into_iter().find(|i| i.id == id))
    }

    pub fn list(&self) -> QueueResult<Vec<QueueItem>> {
        self.load()
    }

    pub fn list_by_status(&self, status: QueueStatus) -> QueueResult<Vec<QueueItem>> {
        Ok(self.load()?.into_iter().filter(|i| i.status == status).collect())
    }

    /// Items handed to a human.
    pub fn needs_manual(&self) -> QueueResult<Vec<QueueItem>> {
        self.list_by_status(QueueStatus::NeedsManual)
    }

    /// Pending run item for `run_id`, if one is scheduled.
    pub fn pending_run(&self, run_id: &str) -> QueueResult<Option<QueueItem>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|i| i.kind == ItemKind::Run && i.source == run_id && i.status == QueueStatus::Pending))
    }

    /// Apply every due file move through `applier`.
    ///
    /// Run items are left for the supervisor.
    pub async fn process_due(
        &self,
        applier: &dyn ActionApplier,
        now: DateTime<Utc>,
    ) -> QueueResult<ProcessReport> {
        let mut report = ProcessReport::default();
        let due: Vec<QueueItem> = self
            .eligible_for_retry(now)?
            .into_iter()
            .filter(|i| i.kind == ItemKind::FileMove)
            .collect();

        for item in due {
            match applier.apply(&item).await {
                Ok(()) => {
                    self.mark_succeeded(&item.id)?;
                    info!(id = %item.id, "Queued action applied");
                    report.succeeded += 1;
                }
                Err(failure) => {
                    warn!(
                        id = %item.id,
                        reason = %failure.reason,
                        error = %failure.message,
                        "Queued action failed"
                    );
                    let updated =
                        self.record_failure(&item.id, &failure.reason, Some(failure.message))?;
                    match updated.status {
                        QueueStatus::Pending => report.rescheduled += 1,
                        QueueStatus::NeedsManual => report.needs_manual += 1,
                        QueueStatus::Abandoned => report.abandoned += 1,
                        QueueStatus::Succeeded => {}
                    }
                }
            }
        }

        Ok(report)
    }
}

/// The still-pending item `id`, under the write guard.
fn pending_mut<'a>(items: &'a mut [QueueItem], id: &str) -> QueueResult<&'a mut QueueItem> {
    let item = items
        .iter_mut()
        .find(|i| i.id == id)
        .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
    if item.status.is_terminal() {
        return Err(QueueError::Terminal {
            id: id.to_string(),
            status: item.status,
        });
    }
    Ok(item)
}
