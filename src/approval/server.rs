//! HTTP callback endpoint for approval decisions.
//!
//! `GET /approvals/{id}` returns the request; `POST /approvals/{id}` with
//! `{"decision": "approve" | "reject"}` decides it. When a shared secret is
//! configured, POST bodies must carry `X-Warden-Signature: sha256=<hex>`, the
//! HMAC-SHA256 of the raw body.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{ApprovalError, ApprovalGateway, ApprovalRequest, Decision, ResponseMethod};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-warden-signature";

/// Errors returned by the callback routes.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature format")]
    InvalidSignatureFormat,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown approval ID")]
    NotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CallbackError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSignature | Self::InvalidSignatureFormat | Self::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        // Keep details of signature checks and internal state out of responses.
        let body = match &self {
            Self::MissingSignature => "Missing signature",
            Self::InvalidSignatureFormat => "Invalid signature format",
            Self::InvalidSignature => "Invalid signature",
            Self::InvalidPayload(_) => "Invalid payload",
            Self::NotFound => "Not Found",
            Self::Internal(_) => "Internal server error",
        };
        (self.status_code(), body).into_response()
    }
}

impl From<ApprovalError> for CallbackError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::UnknownId(_) | ApprovalError::InvalidId(_) => CallbackError::NotFound,
            other => CallbackError::Internal(other.to_string()),
        }
    }
}

/// Body of a decision callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackBody {
    /// Must match the ID in the path when present.
    #[serde(default)]
    pub approval_id: Option<String>,
    pub decision: Decision,
}

/// Response to a decision callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackAck {
    pub approval_id: String,
    pub status: String,
    /// False when the request had already been decided.
    pub applied: bool,
}

#[derive(Clone)]
struct CallbackState {
    gateway: Arc<ApprovalGateway>,
    secret: Option<Arc<str>>,
}

/// Sign `body` the way callers must for a gateway configured with `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
        }
        Err(_) => String::new(),
    }
}

fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), CallbackError> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .ok_or(CallbackError::MissingSignature)?
        .to_str()
        .map_err(|_| CallbackError::InvalidSignatureFormat)?;
    let hex_sig = header
        .strip_prefix("sha256=")
        .ok_or(CallbackError::InvalidSignatureFormat)?;
    let expected = hex::decode(hex_sig).map_err(|_| CallbackError::InvalidSignatureFormat)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CallbackError::Internal(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| CallbackError::InvalidSignature)
}

/// Build the callback router for `gateway`.
pub fn router(gateway: Arc<ApprovalGateway>, secret: Option<String>) -> Router {
    let state = CallbackState {
        gateway,
        secret: secret.filter(|s| !s.is_empty()).map(Arc::from),
    };
    Router::new()
        .route("/approvals/{id}", get(get_approval).post(post_decision))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn get_approval(
    State(state): State<CallbackState>,
    Path(id): Path<String>,
) -> Result<Json<ApprovalRequest>, CallbackError> {
    Ok(Json(state.gateway.get_status(&id)?))
}

async fn post_decision(
    State(state): State<CallbackState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackAck>, CallbackError> {
    if let Some(secret) = &state.secret {
        if let Err(err) = verify_signature(secret, &headers, &body) {
            warn!(approval_id = %id, error = %err, "Rejected approval callback");
            return Err(err);
        }
    }

    let payload: CallbackBody =
        serde_json::from_slice(&body).map_err(|e| CallbackError::InvalidPayload(e.to_string()))?;
    if let Some(body_id) = &payload.approval_id {
        if body_id != &id {
            return Err(CallbackError::InvalidPayload(
                "approval_id does not match path".into(),
            ));
        }
    }

    let outcome = state
        .gateway
        .resolve(&id, payload.decision, ResponseMethod::Http)?;
    Ok(Json(CallbackAck {
        approval_id: id,
        status: outcome.request().status.to_string(),
        applied: outcome.was_applied(),
    }))
}

/// Serve `router` on `listener` until `shutdown` completes.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Approval callback server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
