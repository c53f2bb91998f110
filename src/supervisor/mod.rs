//! Session orchestration.
//!
//! A [`Supervisor`] takes a list of run ids and an anchor, checks the
//! anchor's parallelism policy, then drives every run through
//! lock -> lease -> execute -> (approve) -> retry or finish on a bounded
//! worker pool. Locks and leases are released on every terminal outcome.

mod executor;
mod state;

pub use executor::{ApprovalNeed, BuildExecutor, CommandBuildExecutor, ExecutionReport, WorkItem};
pub use state::{RunOutcome, RunRecord, RunState, SessionReport};

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::anchor::{Anchor, LoadedAnchor};
use crate::approval::{ApprovalGateway, ApprovalStatus};
use crate::config::StateLayout;
use crate::error::{WardenError, WardenResult};
use crate::evidence::{generate_session_id, EvidenceStoreConfig, EvidenceWriter, RunCompletion};
use crate::governance::{GateDecision, GovernanceGate, ProtectedPaths};
use crate::lock::{LockError, ProcessProbe, RunLockManager};
use crate::metrics::{SessionMetricsCollector, SessionMetricsStore};
use crate::queue::{ItemKind, NewItem, PendingActionQueue, QueueItem};
use crate::retry::{classify_failure, RetryDecision, RetryPolicyEngine};
use crate::timeout::TimeoutConfig;
use crate::workspace::WorkspaceIsolationManager;

const APPROVAL_REJECTED: &str = "approval-rejected";
const APPROVAL_TIMEOUT: &str = "approval-timeout";

/// Settings for one supervision session.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    /// Workers asked for; the pool is `min(requested, max_concurrent_runs)`.
    pub requested_workers: u32,
    /// Give every run its own `runs/<run_id>/` storage instead of `runs/shared/`.
    pub per_run_storage: bool,
    /// Also dispatch runs whose deferred retry is due.
    pub resume_due: bool,
    /// Longest backoff slept through while holding the run's lock.
    pub inline_backoff_ceiling: Duration,
    pub timeouts: TimeoutConfig,
    pub base_branch: String,
    pub branch_prefix: String,
    pub evidence: EvidenceStoreConfig,
}

impl SupervisorConfig {
    pub fn new(project_root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            state_dir: state_dir.into(),
            requested_workers: 1,
            per_run_storage: false,
            resume_due: false,
            inline_backoff_ceiling: Duration::from_secs(600),
            timeouts: TimeoutConfig::default(),
            base_branch: "HEAD".to_string(),
            branch_prefix: "warden".to_string(),
            evidence: EvidenceStoreConfig::default(),
        }
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.requested_workers = workers;
        self
    }

    pub fn with_per_run_storage(mut self, enabled: bool) -> Self {
        self.per_run_storage = enabled;
        self
    }

    pub fn with_resume_due(mut self, enabled: bool) -> Self {
        self.resume_due = enabled;
        self
    }

    pub fn with_inline_backoff_ceiling(mut self, ceiling: Duration) -> Self {
        self.inline_backoff_ceiling = ceiling;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_base_branch(mut self, base_branch: impl Into<String>) -> Self {
        self.base_branch = base_branch.into();
        self
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    pub fn with_evidence_config(mut self, evidence: EvidenceStoreConfig) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Asks a running session to stop.
///
/// No new runs start after a stop; in-flight runs finish their current
/// attempt, and pending backoffs turn into scheduled retries.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    layout: StateLayout,
    locks: Arc<RunLockManager>,
    queue: Arc<PendingActionQueue>,
    approvals: Arc<ApprovalGateway>,
    executor: Arc<dyn BuildExecutor>,
    probe: Arc<dyn ProcessProbe>,
    gate: GovernanceGate,
    stop: StopHandle,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        executor: Arc<dyn BuildExecutor>,
        approvals: Arc<ApprovalGateway>,
        engine: RetryPolicyEngine,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let layout = StateLayout::new(&config.state_dir);
        Self {
            locks: Arc::new(RunLockManager::new(layout.locks_dir(), probe.clone())),
            queue: Arc::new(PendingActionQueue::new(layout.queue_path(), engine)),
            layout,
            config,
            approvals,
            executor,
            probe,
            gate: GovernanceGate,
            stop: StopHandle::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn queue(&self) -> &PendingActionQueue {
        &self.queue
    }

    pub fn locks(&self) -> &RunLockManager {
        &self.locks
    }

    /// Supervise `run_ids` under `anchor`.
    ///
    /// Returns [`WardenError::GovernanceDenied`] without dispatching anything
    /// when the anchor forbids the requested parallelism.
    pub async fn run(&self, run_ids: &[String], anchor: &LoadedAnchor) -> WardenResult<SessionReport> {
        let session_id = generate_session_id();
        let evidence = match EvidenceWriter::new(
            &self.config.state_dir,
            session_id.clone(),
            self.config.evidence,
        ) {
            Ok(writer) => Some(writer),
            Err(err) => {
                warn!(error = %err, "Failed to open evidence ledger; continuing without it");
                None
            }
        };

        let run_ids = self.collect_runs(run_ids)?;
        if let Some(writer) = &evidence {
            writer.emit_session_start(json!({
                "anchor_path": anchor.path,
                "anchor_digest": anchor.digest,
                "runs": run_ids,
                "requested_workers": self.config.requested_workers,
            }));
        }

        if let GateDecision::Deny(reason) = self.gate.check(&anchor.anchor, self.config.requested_workers) {
            warn!(session_id = %session_id, reason = %reason, "Governance gate denied session");
            if let Some(writer) = &evidence {
                writer.emit_session_complete("governance_denied", Some(reason.clone()));
            }
            return Err(WardenError::GovernanceDenied(reason));
        }

        let workers = self
            .gate
            .effective_workers(&anchor.anchor, self.config.requested_workers);
        info!(
            session_id = %session_id,
            runs = run_ids.len(),
            workers,
            isolation = %anchor.anchor.parallelism.isolation_level,
            "Starting supervision session"
        );

        let metrics = SessionMetricsCollector::new(session_id.clone(), workers as u32);
        let workspaces = WorkspaceIsolationManager::new(
            &self.config.project_root,
            &self.config.state_dir,
            anchor.anchor.parallelism.isolation_level,
            self.probe.clone(),
        )
        .with_base_branch(self.config.base_branch.clone())
        .with_branch_prefix(self.config.branch_prefix.clone())
        .with_git_timeout(self.config.timeouts.git_timeout);

        let ctx = Arc::new(RunContext {
            anchor_path: anchor.path.clone(),
            protected: ProtectedPaths::from_anchor(&anchor.anchor),
            anchor: anchor.anchor.clone(),
            layout: self.layout.clone(),
            per_run_storage: self.config.per_run_storage,
            inline_backoff_ceiling: self.config.inline_backoff_ceiling,
            deadline: anchor
                .anchor
                .budgets
                .max_session_secs
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
            locks: self.locks.clone(),
            workspaces: Arc::new(workspaces),
            queue: self.queue.clone(),
            approvals: self.approvals.clone(),
            executor: self.executor.clone(),
            evidence: evidence.clone(),
            metrics: metrics.clone(),
            stop: self.stop.clone(),
        });

        let (background_tx, background_rx) = watch::channel(false);
        let background = self.approvals.clone().spawn_background(
            self.config.timeouts.mailbox_poll_interval,
            self.config.timeouts.approval_sweep_interval,
            background_rx,
        );

        let runs = self.dispatch(&ctx, run_ids, workers).await;

        let _ = background_tx.send(true);
        if let Err(err) = background.await {
            warn!(error = %err, "Approval background task failed");
        }

        let report = SessionReport {
            session_id: session_id.clone(),
            workers,
            runs,
        };
        if let Err(err) = SessionMetricsStore::new(&self.config.state_dir).save(&metrics.finish()) {
            warn!(session_id = %session_id, error = %err, "Failed to save session metrics");
        }
        let exit = report.exit();
        if let Some(writer) = &evidence {
            writer.emit_session_complete(exit.as_label(), None);
        }
        info!(session_id = %session_id, exit = exit.as_label(), "Supervision session finished");
        Ok(report)
    }

    /// Requested runs in order without duplicates, plus due deferred runs.
    fn collect_runs(&self, run_ids: &[String]) -> WardenResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut runs: Vec<String> = run_ids
            .iter()
            .filter(|id| seen.insert(id.to_string()))
            .cloned()
            .collect();

        if self.config.resume_due {
            for item in self.queue.eligible_for_retry(Utc::now())? {
                if item.kind == ItemKind::Run && seen.insert(item.source.clone()) {
                    debug!(run_id = %item.source, attempt = item.attempt_count, "Resuming due run");
                    runs.push(item.source);
                }
            }
        }
        Ok(runs)
    }

    async fn dispatch(&self, ctx: &Arc<RunContext>, run_ids: Vec<String>, workers: usize) -> Vec<RunRecord> {
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut records: Vec<Option<RunRecord>> = Vec::with_capacity(run_ids.len());
        let mut slots = Vec::new();
        let mut handles = Vec::new();

        for run_id in run_ids {
            if ctx.should_stop() {
                records.push(Some(ctx.not_started(&run_id)));
                continue;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    records.push(Some(ctx.not_started(&run_id)));
                    continue;
                }
            };
            // The stop may have arrived while waiting for a free worker.
            if ctx.should_stop() {
                drop(permit);
                records.push(Some(ctx.not_started(&run_id)));
                continue;
            }

            let task_ctx = ctx.clone();
            let task_run_id = run_id.clone();
            slots.push((records.len(), run_id));
            records.push(None);
            handles.push(tokio::spawn(async move {
                // Hold the permit until the run reaches a terminal state
                let _permit = permit;
                task_ctx.run_one(&task_run_id).await
            }));
        }

        let results = futures::future::join_all(handles).await;
        for ((index, run_id), result) in slots.into_iter().zip(results) {
            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "Run task panicked");
                    RunRecord::new(
                        run_id,
                        RunOutcome::Infrastructure {
                            message: format!("run task failed: {}", err),
                        },
                    )
                }
            };
            records[index] = Some(record);
        }
        records.into_iter().flatten().collect()
    }
}

/// Everything a run task needs, shared across the pool.
struct RunContext {
    anchor_path: PathBuf,
    anchor: Anchor,
    protected: ProtectedPaths,
    layout: StateLayout,
    per_run_storage: bool,
    inline_backoff_ceiling: Duration,
    deadline: Option<Instant>,
    locks: Arc<RunLockManager>,
    workspaces: Arc<WorkspaceIsolationManager>,
    queue: Arc<PendingActionQueue>,
    approvals: Arc<ApprovalGateway>,
    executor: Arc<dyn BuildExecutor>,
    evidence: Option<EvidenceWriter>,
    metrics: SessionMetricsCollector,
    stop: StopHandle,
}

impl RunContext {
    fn should_stop(&self) -> bool {
        self.stop.is_stopped() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn transition(&self, run_id: &str, state: RunState, attempt: u32) {
        debug!(run_id, state = %state, attempt, "Run transition");
        if let Some(writer) = &self.evidence {
            writer.emit_run_transition(run_id, state.as_str(), attempt);
        }
    }

    fn not_started(&self, run_id: &str) -> RunRecord {
        info!(run_id, "Session stopping; run not started");
        self.finish(RunRecord::new(run_id, RunOutcome::NotStarted), Instant::now())
    }

    /// Record a terminal outcome in the ledger and the metrics.
    fn finish(&self, mut record: RunRecord, started: Instant) -> RunRecord {
        let duration = started.elapsed();
        record.duration_ms = duration.as_millis() as u64;

        if let Some(state) = record.outcome.final_state() {
            self.transition(&record.run_id, state, record.attempts);
        }
        let message = match &record.outcome {
            RunOutcome::Infrastructure { message } => Some(message.clone()),
            _ => record.last_error.clone(),
        };
        if let Some(writer) = &self.evidence {
            writer.emit_run_complete(
                &record.run_id,
                RunCompletion {
                    outcome: record.outcome.label().to_string(),
                    reason: record.reason.clone(),
                    attempts: record.attempts,
                    approval_id: record.approval_id.clone(),
                    message,
                },
            );
        }
        self.metrics.complete_run(
            &record.run_id,
            record.outcome.label(),
            record.attempts,
            duration,
            record.reason.clone(),
        );

        info!(
            run_id = %record.run_id,
            outcome = record.outcome.label(),
            attempts = record.attempts,
            reason = record.reason.as_deref().unwrap_or("-"),
            "Run finished"
        );
        record
    }

    async fn run_one(&self, run_id: &str) -> RunRecord {
        let started = Instant::now();
        self.transition(run_id, RunState::Queued, 0);

        let lock = match self.locks.acquire(run_id) {
            Ok(lock) => lock,
            Err(LockError::AlreadyLocked { holder_pid, hostname, .. }) => {
                info!(run_id, holder_pid, hostname = %hostname, "Run already running; skipping");
                let outcome = RunOutcome::AlreadyRunning {
                    holder_pid: Some(holder_pid),
                };
                return self.finish(RunRecord::new(run_id, outcome), started);
            }
            Err(err) => return self.finish(infrastructure(run_id, 0, err.to_string()), started),
        };
        self.metrics.start_run(run_id);
        self.transition(run_id, RunState::Locked, 0);

        let record = match self.workspaces.lease(run_id).await {
            Ok(lease) => {
                self.transition(run_id, RunState::WorkspaceLeased, 0);
                let driven = AssertUnwindSafe(self.drive(run_id, &lease.workspace_path))
                    .catch_unwind()
                    .await;
                if let Err(err) = self.workspaces.release(run_id).await {
                    warn!(run_id, error = %err, "Failed to release workspace lease");
                }
                match driven {
                    Ok(record) => record,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(run_id, panic = %message, "Run panicked");
                        infrastructure(run_id, 0, format!("run panicked: {}", message))
                    }
                }
            }
            Err(err) => {
                warn!(run_id, error = %err, "Failed to lease workspace");
                infrastructure(run_id, 0, err.to_string())
            }
        };

        if let Err(err) = self.locks.release(lock) {
            warn!(run_id, error = %err, "Failed to release run lock");
        }
        self.finish(record, started)
    }

    /// Attempt loop for a leased run.
    async fn drive(&self, run_id: &str, workspace: &Path) -> RunRecord {
        let prior = match self.queue.pending_run(run_id) {
            Ok(item) => item,
            Err(err) => {
                warn!(run_id, error = %err, "Failed to read pending queue item");
                None
            }
        };
        let mut attempt = prior.as_ref().map_or(0, |item| item.attempt_count) + 1;

        let storage_dir = self.layout.run_storage(run_id, self.per_run_storage);
        if let Err(err) = std::fs::create_dir_all(&storage_dir) {
            return infrastructure(run_id, 0, format!("cannot create run storage: {}", err));
        }

        let mut approved_actions: Vec<String> = Vec::new();
        let mut approval_id: Option<String> = None;

        loop {
            self.transition(run_id, RunState::Executing, attempt);
            let item = WorkItem {
                run_id: run_id.to_string(),
                attempt,
                storage_dir: storage_dir.clone(),
                approved_actions: approved_actions.clone(),
                anchor_path: self.anchor_path.clone(),
            };
            let report = self.executor.execute(workspace, &item).await;

            let need = report
                .approval_required
                .clone()
                .filter(|need| !approved_actions.contains(&need.action_type));
            if let Some(need) = need {
                self.transition(run_id, RunState::AwaitingApproval, attempt);
                self.metrics.record_approval(run_id);

                let info = self.decision_info(run_id, attempt, &need);
                let request = match self.approvals.request(run_id, &need.action_type, info).await {
                    Ok(request) => request,
                    Err(err) => return infrastructure(run_id, attempt, err.to_string()),
                };
                approval_id = Some(request.id.clone());

                let decided = match self.approvals.wait_for_decision(&request.id).await {
                    Ok(decided) => decided,
                    Err(err) => return infrastructure(run_id, attempt, err.to_string()),
                };
                match decided.status {
                    ApprovalStatus::Approved => {
                        info!(run_id, approval_id = %decided.id, action = %need.action_type, "Approval granted; re-dispatching");
                        approved_actions.push(need.action_type);
                        continue;
                    }
                    ApprovalStatus::Rejected => {
                        let mut record = self.close_pending(
                            run_id,
                            prior.as_ref(),
                            RunOutcome::ApprovalRejected,
                            APPROVAL_REJECTED,
                            attempt,
                        );
                        record.approval_id = approval_id;
                        return record;
                    }
                    ApprovalStatus::Timeout | ApprovalStatus::Pending => {
                        let mut record = self.close_pending(
                            run_id,
                            prior.as_ref(),
                            RunOutcome::ApprovalTimedOut,
                            APPROVAL_TIMEOUT,
                            attempt,
                        );
                        record.approval_id = approval_id;
                        return record;
                    }
                }
            }

            if report.success {
                if let Some(item) = &prior {
                    if let Err(err) = self.queue.mark_succeeded(&item.id) {
                        warn!(run_id, id = %item.id, error = %err, "Failed to close queue item");
                    }
                }
                let mut record = RunRecord::new(run_id, RunOutcome::Completed);
                record.attempts = attempt;
                record.approval_id = approval_id;
                return record;
            }

            let raw_reason = match report.failure_reason.as_deref() {
                Some(reason) => reason,
                None => classify_failure(report.message.as_deref().unwrap_or("")),
            };
            let reason = self.queue.engine().normalize_reason(raw_reason);
            let decision = self.decide(&reason, attempt);
            warn!(
                run_id,
                attempt,
                reason = %reason,
                decision = ?decision,
                "Run attempt failed"
            );

            if let RetryDecision::Retry { after } = decision {
                if self.can_wait_inline(after) && self.backoff(after).await {
                    attempt += 1;
                    continue;
                }
            }

            let mut record = self.settle(run_id, prior.as_ref(), &reason, attempt, decision, report.message);
            record.approval_id = approval_id;
            return record;
        }
    }

    /// Retry decision with the anchor's attempt budget applied.
    fn decide(&self, reason: &str, attempt: u32) -> RetryDecision {
        let engine = self.queue.engine();
        let decision = engine.decide(reason, attempt);
        match (decision, self.anchor.budgets.max_attempts_per_run) {
            (RetryDecision::Retry { .. }, Some(cap)) if attempt >= cap => {
                if engine.policy_for(reason).escalate_to_manual {
                    RetryDecision::Escalate
                } else {
                    RetryDecision::Abandon
                }
            }
            _ => decision,
        }
    }

    fn can_wait_inline(&self, after: Duration) -> bool {
        after <= self.inline_backoff_ceiling
            && !self.stop.is_stopped()
            && self.deadline.map_or(true, |d| Instant::now() + after < d)
    }

    /// Sleep out a backoff. Returns false if the session was stopped meanwhile.
    async fn backoff(&self, after: Duration) -> bool {
        let mut stop_rx = self.stop.subscribe();
        if *stop_rx.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(after) => true,
            _ = stop_rx.changed() => false,
        }
    }

    /// Persist a failure's decision to the queue and build the run record.
    fn settle(
        &self,
        run_id: &str,
        prior: Option<&QueueItem>,
        reason: &str,
        attempt: u32,
        decision: RetryDecision,
        last_error: Option<String>,
    ) -> RunRecord {
        let persisted = match prior {
            Some(item) => self
                .queue
                .record_outcome(&item.id, reason, attempt, decision, last_error.clone()),
            None => self.queue.enqueue_decided(
                NewItem::run(run_id),
                reason,
                attempt,
                decision,
                last_error.clone(),
            ),
        };

        let outcome = match (decision, persisted) {
            (RetryDecision::Retry { .. }, Ok(item)) => RunOutcome::RetryScheduled {
                next_retry_at: item.next_retry_at.unwrap_or_else(Utc::now),
                queue_id: item.id,
            },
            (RetryDecision::Retry { .. }, Err(err)) => RunOutcome::Infrastructure {
                message: format!("failed to schedule retry: {}", err),
            },
            (terminal, persisted) => {
                if let Err(err) = persisted {
                    warn!(run_id, error = %err, "Failed to record terminal queue item");
                }
                if terminal == RetryDecision::Escalate {
                    RunOutcome::Escalated
                } else {
                    RunOutcome::Abandoned
                }
            }
        };

        let mut record = RunRecord::new(run_id, outcome);
        record.attempts = attempt;
        record.reason = Some(reason.to_string());
        record.last_error = last_error;
        record
    }

    /// End a run on an approval outcome, closing any deferred retry it had.
    fn close_pending(
        &self,
        run_id: &str,
        prior: Option<&QueueItem>,
        outcome: RunOutcome,
        reason: &str,
        attempt: u32,
    ) -> RunRecord {
        if let Some(item) = prior {
            if let Err(err) =
                self.queue
                    .record_outcome(&item.id, reason, attempt, RetryDecision::Abandon, None)
            {
                warn!(run_id, id = %item.id, error = %err, "Failed to close queue item");
            }
        }
        let mut record = RunRecord::new(run_id, outcome);
        record.attempts = attempt;
        record.reason = Some(reason.to_string());
        record
    }

    fn decision_info(&self, run_id: &str, attempt: u32, need: &ApprovalNeed) -> serde_json::Value {
        json!({
            "run_id": run_id,
            "attempt": attempt,
            "paths": need.paths,
            "protected_paths": self.protected.filter(&need.paths),
            "details": need.decision_info,
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn infrastructure(run_id: &str, attempts: u32, message: String) -> RunRecord {
    let mut record = RunRecord::new(run_id, RunOutcome::Infrastructure { message });
    record.attempts = attempts;
    record
}
