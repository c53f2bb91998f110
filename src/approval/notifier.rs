use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use super::ApprovalRequest;

/// Errors raised while announcing an approval request.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),
}

/// Announces a new approval request to the humans who can decide it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: &ApprovalRequest) -> Result<(), NotifyError>;
}

/// Writes the request and the commands to answer it to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, request: &ApprovalRequest) -> Result<(), NotifyError> {
        info!(
            approval_id = %request.id,
            run_id = %request.run_id,
            action = %request.action_type,
            expires_at = %request.expires_at.to_rfc3339(),
            "Approval required: run `wardenctl approve {}` or `wardenctl reject {}`",
            request.id,
            request.id,
        );
        Ok(())
    }
}

/// POSTs the request to a webhook with two choices bound to its approval ID.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    callback_base: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            callback_base: None,
        }
    }

    /// Base URL of the callback server, used to build per-choice callback links.
    pub fn with_callback_base(mut self, base: impl Into<String>) -> Self {
        self.callback_base = Some(base.into());
        self
    }

    pub fn payload(&self, request: &ApprovalRequest) -> serde_json::Value {
        let callback = self
            .callback_base
            .as_ref()
            .map(|base| format!("{}/approvals/{}", base.trim_end_matches('/'), request.id));
        json!({
            "approval_id": request.id,
            "run_id": request.run_id,
            "type": request.action_type,
            "decision_info": request.decision_info,
            "created_at": request.created_at,
            "expires_at": request.expires_at,
            "callback_url": callback,
            "choices": [
                {"label": "Approve", "decision": "approve", "approval_id": request.id},
                {"label": "Reject", "decision": "reject", "approval_id": request.id},
            ],
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, request: &ApprovalRequest) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(request))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        info!(approval_id = %request.id, "Approval webhook delivered");
        Ok(())
    }
}

/// Keeps every announced request in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    pub sent: std::sync::Mutex<Vec<ApprovalRequest>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .map(|s| s.iter().map(|r| r.id.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, request: &ApprovalRequest) -> Result<(), NotifyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(request.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalStatus;
    use chrono::Utc;

    fn pending_request() -> ApprovalRequest {
        let now = Utc::now();
        ApprovalRequest {
            id: "apr-000042".into(),
            run_id: "run-1".into(),
            action_type: "force-push".into(),
            decision_info: json!({"branch": "main"}),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now,
            responded_at: None,
            response_method: None,
        }
    }

    #[test]
    fn test_log_and_recording_notifiers_succeed() {
        let request = pending_request();
        tokio_test::block_on(LogNotifier.notify(&request)).expect("log notifier");

        let recorder = RecordingNotifier::default();
        tokio_test::block_on(recorder.notify(&request)).expect("recording notifier");
        assert_eq!(recorder.ids(), vec!["apr-000042".to_string()]);
    }

    #[test]
    fn test_webhook_payload_binds_choices_to_id() {
        let request = pending_request();

        let payload = WebhookNotifier::new("http://hooks.invalid/approve")
            .with_callback_base("http://127.0.0.1:8787/")
            .payload(&request);

        assert_eq!(payload["choices"][0]["approval_id"], "apr-000042");
        assert_eq!(payload["choices"][1]["decision"], "reject");
        assert_eq!(
            payload["callback_url"],
            "http://127.0.0.1:8787/approvals/apr-000042"
        );
    }
}
