use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ApprovalError, ApprovalRequest, ApprovalResult, ApprovalStatus, ApprovalStore, Decision,
    Mailbox, Notifier, ResolveOutcome, ResponseMethod,
};

/// Creates approval requests, applies decisions and wakes waiting runs.
///
/// Waiters suspend on a per-ID watch channel; a decision arriving through
/// any channel (mailbox, HTTP, direct call, timeout) resolves the persisted
/// row first and then signals the channel.
pub struct ApprovalGateway {
    store: ApprovalStore,
    mailbox: Mailbox,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    waiters: Mutex<HashMap<String, watch::Sender<ApprovalStatus>>>,
}

impl std::fmt::Debug for ApprovalGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGateway")
            .field("store", &self.store.path())
            .field("mailbox", &self.mailbox.dir())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ApprovalGateway {
    pub fn new(store: ApprovalStore, mailbox: Mailbox, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            mailbox,
            notifier,
            timeout: Duration::from_secs(86_400),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Age after which a pending request times out.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &ApprovalStore {
        &self.store
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn sender(&self, id: &str, initial: ApprovalStatus) -> watch::Sender<ApprovalStatus> {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(initial).0)
            .clone()
    }

    fn signal(&self, request: &ApprovalRequest) {
        let waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = waiters.get(&request.id) {
            sender.send_replace(request.status);
        }
    }

    /// Drop the channel for `id` once nobody is subscribed to it.
    fn forget(&self, id: &str) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        if waiters.get(id).is_some_and(|sender| sender.receiver_count() == 0) {
            waiters.remove(id);
        }
    }

    /// Persist a pending request, announce it, and return it.
    ///
    /// A failed announcement is logged; the request stays pending and can
    /// still be decided through the mailbox or callback server.
    pub async fn request(
        &self,
        run_id: &str,
        action_type: &str,
        decision_info: serde_json::Value,
    ) -> ApprovalResult<ApprovalRequest> {
        let request = self
            .store
            .create(run_id, action_type, decision_info, self.timeout)?;
        self.sender(&request.id, ApprovalStatus::Pending);

        info!(
            approval_id = %request.id,
            run_id,
            action = action_type,
            "Approval requested"
        );
        if let Err(err) = self.notifier.notify(&request).await {
            warn!(approval_id = %request.id, error = %err, "Failed to deliver approval notification");
        }
        Ok(request)
    }

    /// Current state of a request.
    pub fn get_status(&self, id: &str) -> ApprovalResult<ApprovalRequest> {
        self.store
            .get(id)?
            .ok_or_else(|| ApprovalError::UnknownId(id.to_string()))
    }

    /// Apply a decision. Deciding an already terminal request is a no-op.
    pub fn resolve(
        &self,
        id: &str,
        decision: Decision,
        method: ResponseMethod,
    ) -> ApprovalResult<ResolveOutcome> {
        let outcome = self.store.resolve(id, decision.status(), method)?;
        match &outcome {
            ResolveOutcome::Applied(request) => {
                info!(approval_id = id, status = %request.status, method = ?method, "Approval decided");
                self.signal(request);
            }
            ResolveOutcome::AlreadyTerminal(request) => {
                debug!(approval_id = id, status = %request.status, "Ignoring decision for decided approval");
            }
        }
        Ok(outcome)
    }

    /// Time out every overdue pending request.
    pub fn expire_stale(&self) -> ApprovalResult<Vec<ApprovalRequest>> {
        let expired = self.store.expire_stale(Utc::now())?;
        for request in &expired {
            warn!(approval_id = %request.id, run_id = %request.run_id, "Approval timed out");
            self.signal(request);
        }
        Ok(expired)
    }

    /// Apply every decision waiting in the mailbox. Returns how many took effect.
    pub fn drain_mailbox(&self) -> ApprovalResult<usize> {
        let mut applied = 0;
        for (path, message) in self.mailbox.read_all()? {
            match self.resolve(&message.approval_id, message.decision, ResponseMethod::Mailbox) {
                Ok(outcome) if outcome.was_applied() => applied += 1,
                Ok(_) => {}
                Err(ApprovalError::UnknownId(id)) => {
                    warn!(approval_id = %id, "Mailbox decision for unknown approval");
                }
                Err(err) => return Err(err),
            }
            self.mailbox.remove(&path)?;
        }
        Ok(applied)
    }

    /// Suspend until request `id` reaches a terminal state.
    ///
    /// Reaching the request's deadline times it out. Returns the terminal row.
    pub async fn wait_for_decision(&self, id: &str) -> ApprovalResult<ApprovalRequest> {
        let mut rx = self.sender(id, ApprovalStatus::Pending).subscribe();
        let result = self.wait_on(id, &mut rx).await;
        drop(rx);
        self.forget(id);
        result
    }

    async fn wait_on(
        &self,
        id: &str,
        rx: &mut watch::Receiver<ApprovalStatus>,
    ) -> ApprovalResult<ApprovalRequest> {
        let mut channel_open = true;
        loop {
            let request = self.get_status(id)?;
            if request.status.is_terminal() {
                return Ok(request);
            }

            let remaining = (request.expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                self.expire_stale()?;
                continue;
            }

            if channel_open {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            channel_open = false;
                        }
                    }
                    _ = tokio::time::sleep(remaining) => {}
                }
            } else {
                tokio::time::sleep(remaining).await;
            }
        }
    }

    /// Poll the mailbox and sweep for timeouts until `shutdown` flips to true.
    pub fn spawn_background(
        self: Arc<Self>,
        mailbox_poll: Duration,
        sweep_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(mailbox_poll.max(Duration::from_millis(1)));
            let mut sweep = tokio::time::interval(sweep_interval.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        if let Err(err) = self.drain_mailbox() {
                            warn!(error = %err, "Failed to drain approval mailbox");
                        }
                    }
                    _ = sweep.tick() => {
                        if let Err(err) = self.expire_stale() {
                            warn!(error = %err, "Approval timeout sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Approval background task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::RecordingNotifier;
    use tempfile::TempDir;

    fn gateway(dir: &TempDir, timeout: Duration) -> (Arc<ApprovalGateway>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = ApprovalGateway::new(
            ApprovalStore::new(dir.path().join("approvals.json")),
            Mailbox::new(dir.path().join("mailbox")),
            notifier.clone(),
        )
        .with_timeout(timeout);
        (Arc::new(gateway), notifier)
    }

    #[tokio::test]
    async fn test_request_notifies_with_id() {
        let temp_dir = TempDir::new().expect("temp dir");
        let (gateway, notifier) = gateway(&temp_dir, Duration::from_secs(60));

        let request = gateway
            .request("run-1", "delete-files", serde_json::json!({"count": 3}))
            .await
            .expect("request");

        assert_eq!(request.status, ApprovalStatus::Pending);
        assert_eq!(notifier.ids(), vec![request.id.clone()]);
        assert_eq!(
            gateway.get_status(&request.id).expect("status").status,
            ApprovalStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_resolve() {
        let temp_dir = TempDir::new().expect("temp dir");
        let (gateway, _) = gateway(&temp_dir, Duration::from_secs(60));
        let request = gateway
            .request("run-1", "deploy", serde_json::Value::Null)
            .await
            .expect("request");

        let waiter = {
            let gateway = Arc::clone(&gateway);
            let id = request.id.clone();
            tokio::spawn(async move { gateway.wait_for_decision(&id).await })
        };
        tokio::task::yield_now().await;

        gateway
            .resolve(&request.id, Decision::Approve, ResponseMethod::Direct)
            .expect("resolve");

        let decided = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter finished")
            .expect("join")
            .expect("decision");
        assert_eq!(decided.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_second_waiter_still_woken_after_first_leaves() {
        let temp_dir = TempDir::new().expect("temp dir");
        let (gateway, _) = gateway(&temp_dir, Duration::from_secs(60));
        let request = gateway
            .request("run-1", "deploy", serde_json::Value::Null)
            .await
            .expect("request");

        let waiter = {
            let gateway = Arc::clone(&gateway);
            let id = request.id.clone();
            tokio::spawn(async move { gateway.wait_for_decision(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Another waiter on the same id finishing must not drop the channel.
        gateway.forget(&request.id);
        assert!(gateway.waiters.lock().expect("waiters").contains_key(&request.id));

        gateway
            .resolve(&request.id, Decision::Approve, ResponseMethod::Direct)
            .expect("resolve");
        let decided = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter finished")
            .expect("join")
            .expect("decision");

        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert!(gateway.waiters.lock().expect("waiters").is_empty());
    }

    #[tokio::test]
    async fn test_re_resolve_is_noop() {
        let temp_dir = TempDir::new().expect("temp dir");
        let (gateway, _) = gateway(&temp_dir, Duration::from_secs(60));
        let request = gateway
            .request("run-1", "deploy", serde_json::Value::Null)
            .await
            .expect("request");

        gateway
            .resolve(&request.id, Decision::Reject, ResponseMethod::Direct)
            .expect("first");
        let again = gateway
            .resolve(&request.id, Decision::Approve, ResponseMethod::Http)
            .expect("second");

        assert!(!again.was_applied());
        assert_eq!(
            gateway.get_status(&request.id).expect("status").status,
            ApprovalStatus::Rejected
        );
    }

    #[tokio::test]
    async fn test_no_callback_times_out() {
        let temp_dir = TempDir::new().expect("temp dir");
        let (gateway, _) = gateway(&temp_dir, Duration::from_millis(50));
        let request = gateway
            .request("run-1", "deploy", serde_json::Value::Null)
            .await
            .expect("request");

        let decided = tokio::time::timeout(Duration::from_secs(5), gateway.wait_for_decision(&request.id))
            .await
            .expect("wait finished")
            .expect("decision");

        assert_eq!(decided.status, ApprovalStatus::Timeout);
        assert_eq!(decided.response_method, Some(ResponseMethod::TimeoutSweep));
    }

    #[tokio::test]
    async fn test_mailbox_decision_is_applied_once() {
        let temp_dir = TempDir::new().expect("temp dir");
        let (gateway, _) = gateway(&temp_dir, Duration::from_secs(60));
        let request = gateway
            .request("run-1", "deploy", serde_json::Value::Null)
            .await
            .expect("request");

        gateway
            .mailbox()
            .submit(&request.id, Decision::Approve, None)
            .expect("submit");
        gateway
            .mailbox()
            .submit(&request.id, Decision::Reject, None)
            .expect("submit");
        gateway
            .mailbox()
            .submit("apr-999999", Decision::Approve, None)
            .expect("submit");

        assert_eq!(gateway.drain_mailbox().expect("drain"), 1);
        assert!(gateway.mailbox().read_all().expect("read").is_empty());
        let status = gateway.get_status(&request.id).expect("status");
        assert_eq!(status.status, ApprovalStatus::Approved);
        assert_eq!(status.response_method, Some(ResponseMethod::Mailbox));
    }

    #[tokio::test]
    async fn test_background_task_drains_mailbox() {
        let temp_dir = TempDir::new().expect("temp dir");
        let (gateway, _) = gateway(&temp_dir, Duration::from_secs(60));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = Arc::clone(&gateway).spawn_background(
            Duration::from_millis(10),
            Duration::from_secs(60),
            stop_rx,
        );

        let request = gateway
            .request("run-1", "deploy", serde_json::Value::Null)
            .await
            .expect("request");
        gateway
            .mailbox()
            .submit(&request.id, Decision::Reject, Some("ops".into()))
            .expect("submit");

        let decided = tokio::time::timeout(Duration::from_secs(5), gateway.wait_for_decision(&request.id))
            .await
            .expect("wait finished")
            .expect("decision");
        assert_eq!(decided.status, ApprovalStatus::Rejected);

        stop_tx.send(true).expect("stop");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task stopped")
            .expect("join");
    }
}
