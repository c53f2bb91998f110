use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ApprovalError, ApprovalRequest, ApprovalResult, ApprovalStatus, ResolveOutcome, ResponseMethod,
};
use crate::fsutil;
use crate::queue::to_chrono;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApprovalFile {
    next_seq: u64,
    requests: Vec<ApprovalRequest>,
}

/// Approval requests persisted as one JSON document.
#[derive(Debug)]
pub struct ApprovalStore {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl ApprovalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> ApprovalResult<ApprovalFile> {
        Ok(fsutil::read_json(&self.path)?.unwrap_or_default())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut ApprovalFile) -> ApprovalResult<T>) -> ApprovalResult<T> {
        let _guard = self.write_guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load()?;
        let out = f(&mut file)?;
        fsutil::write_json_atomic(&self.path, &file)?;
        Ok(out)
    }

    /// Persist a new pending request and return it.
    pub fn create(
        &self,
        run_id: &str,
        action_type: &str,
        decision_info: serde_json::Value,
        timeout: Duration,
    ) -> ApprovalResult<ApprovalRequest> {
        let now = Utc::now();
        self.mutate(|file| {
            file.next_seq += 1;
            let request = ApprovalRequest {
                id: format!("apr-{:06}", file.next_seq),
                run_id: run_id.to_string(),
                action_type: action_type.to_string(),
                decision_info,
                status: ApprovalStatus::Pending,
                created_at: now,
                expires_at: now + to_chrono(timeout),
                responded_at: None,
                response_method: None,
            };
            file.requests.push(request.clone());
            Ok(request)
        })
    }

    pub fn get(&self, id: &str) -> ApprovalResult<Option<ApprovalRequest>> {
        Ok(self.load()?.requests.into_iter().find(|r| r.id == id))
    }

    pub fn list(&self) -> ApprovalResult<Vec<ApprovalRequest>> {
        Ok(self.load()?.requests)
    }

    pub fn list_pending(&self) -> ApprovalResult<Vec<ApprovalRequest>> {
        Ok(self
            .load()?
            .requests
            .into_iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect())
    }

    /// Move a pending request to `status`. Terminal requests are left untouched.
    pub fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        method: ResponseMethod,
    ) -> ApprovalResult<ResolveOutcome> {
        let now = Utc::now();
        self.mutate(|file| {
            let request = file
                .requests
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| ApprovalError::UnknownId(id.to_string()))?;
            if request.status.is_terminal() {
                return Ok(ResolveOutcome::AlreadyTerminal(request.clone()));
            }
            request.status = status;
            request.responded_at = Some(now);
            request.response_method = Some(method);
            debug!(approval_id = id, status = %status, "Approval request resolved");
            Ok(ResolveOutcome::Applied(request.clone()))
        })
    }

    /// Time out every pending request whose deadline is at or before `now`.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> ApprovalResult<Vec<ApprovalRequest>> {
        self.mutate(|file| {
            let mut expired = Vec::new();
            for request in file
                .requests
                .iter_mut()
                .filter(|r| r.status == ApprovalStatus::Pending && r.expires_at <= now)
            {
                request.status = ApprovalStatus::Timeout;
                request.responded_at = Some(now);
                request.response_method = Some(ResponseMethod::TimeoutSweep);
                expired.push(request.clone());
            }
            Ok(expired)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ApprovalStore {
        ApprovalStore::new(dir.path().join("approvals.json"))
    }

    #[test]
    fn test_ids_are_monotonic_across_instances() {
        let temp_dir = TempDir::new().expect("temp dir");
        let first = store(&temp_dir)
            .create("run-1", "deploy", serde_json::Value::Null, Duration::from_secs(60))
            .expect("create");
        let second = store(&temp_dir)
            .create("run-1", "deploy", serde_json::Value::Null, Duration::from_secs(60))
            .expect("create");

        assert_eq!(first.id, "apr-000001");
        assert_eq!(second.id, "apr-000002");
    }

    #[test]
    fn test_resolve_is_single_transition() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = store(&temp_dir);
        let request = store
            .create("run-1", "deploy", serde_json::Value::Null, Duration::from_secs(60))
            .expect("create");

        let first = store
            .resolve(&request.id, ApprovalStatus::Approved, ResponseMethod::Direct)
            .expect("resolve");
        let second = store
            .resolve(&request.id, ApprovalStatus::Rejected, ResponseMethod::Http)
            .expect("resolve again");

        assert!(first.was_applied());
        assert!(!second.was_applied());
        assert_eq!(second.request().status, ApprovalStatus::Approved);
        assert_eq!(second.request().response_method, Some(ResponseMethod::Direct));
    }

    #[test]
    fn test_unknown_id() {
        let temp_dir = TempDir::new().expect("temp dir");
        let err = store(&temp_dir)
            .resolve("apr-999999", ApprovalStatus::Approved, ResponseMethod::Direct)
            .expect_err("unknown");
        assert!(matches!(err, ApprovalError::UnknownId(_)));
    }

    #[test]
    fn test_expire_stale_only_touches_overdue_pending() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = store(&temp_dir);
        let short = store
            .create("run-1", "deploy", serde_json::Value::Null, Duration::ZERO)
            .expect("create");
        let long = store
            .create("run-2", "deploy", serde_json::Value::Null, Duration::from_secs(3600))
            .expect("create");

        let expired = store.expire_stale(Utc::now()).expect("sweep");

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, short.id);
        assert_eq!(
            store.get(&long.id).expect("get").expect("exists").status,
            ApprovalStatus::Pending
        );
        assert_eq!(store.list_pending().expect("pending").len(), 1);
    }
}
