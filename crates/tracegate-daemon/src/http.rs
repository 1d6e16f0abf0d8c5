//! HTTP API for the gate orchestrator.
//!
//! | Method | Path                    | Success                         |
//! |--------|-------------------------|---------------------------------|
//! | POST   | `/bundles`              | `201 {bundleId}`                |
//! | GET    | `/bundles`              | `200 {bundles: [...]}`          |
//! | GET    | `/bundles/{id}/plan`    | `200 PlanResponse`              |
//! | POST   | `/bundles/{id}/approve` | `200 {status, bundleId, ...}`   |
//! | POST   | `/bundles/{id}/commit`  | `200 {status, receipts}`        |
//! | POST   | `/bundles/{id}/revert`  | `200 {status, results}`         |
//!
//! Failures carry `{error, reasons?}` with the reason list sorted. The
//! ingest body may be the raw `.tgz` bytes or their base64 encoding. All
//! orchestrator work is blocking (SQLite, filesystem, driver HTTP), so
//! handlers run it on the blocking pool.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use tracegate_core::bundle::archive::looks_like_gzip;
use tracegate_core::context::OpContext;

use crate::orchestrator::{GateError, GateOrchestrator};

/// Maximum ingest body size: bundles are small archives, not datasets.
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<GateOrchestrator>,
}

impl AppState {
    /// Wraps an orchestrator for the router.
    #[must_use]
    pub fn new(orchestrator: Arc<GateOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Builds the API router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/bundles", post(ingest_bundle).get(list_bundles))
        .route("/bundles/{id}/plan", get(plan_bundle))
        .route("/bundles/{id}/approve", post(approve_bundle))
        .route("/bundles/{id}/commit", post(commit_bundle))
        .route("/bundles/{id}/revert", post(revert_bundle))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// API error envelope: a status plus `{error, reasons?}`.
struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, error: &str) -> Self {
        Self {
            status,
            body: json!({ "error": error }),
        }
    }

    fn with_reasons(status: StatusCode, error: &str, mut reasons: Vec<String>) -> Self {
        reasons.sort();
        Self {
            status,
            body: json!({ "error": error, "reasons": reasons }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.body)).into_response()
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, "NotFound"),
            GateError::PolicyDenied { reasons } => {
                Self::with_reasons(StatusCode::FORBIDDEN, "PolicyDenied", reasons)
            },
            GateError::ApprovalRequired => {
                Self::new(StatusCode::FORBIDDEN, "ApprovalRequired")
            },
            GateError::AlreadyCommitted { .. } => {
                Self::new(StatusCode::CONFLICT, "AlreadyCommitted")
            },
            GateError::NoReceipts { .. } => Self::new(StatusCode::BAD_REQUEST, "NoReceipts"),
            GateError::DuplicateIntentId { id } => Self {
                status: StatusCode::BAD_REQUEST,
                body: json!({ "error": "DuplicateIntentId", "intentId": id }),
            },
            GateError::Bundle(bundle_err) => Self {
                status: StatusCode::BAD_REQUEST,
                body: json!({ "error": "BundleInvalid", "detail": bundle_err.to_string() }),
            },
            GateError::CommitAborted {
                intent_id,
                reason,
                receipts,
            } => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: json!({
                    "error": "CommitAborted",
                    "intentId": intent_id,
                    "reason": reason,
                    "receipts": receipts,
                }),
            },
            other => {
                tracing::error!(error = %other, "internal gate error");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal")
            },
        }
    }
}

/// Runs blocking orchestrator work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GateError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "blocking task panicked");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal")
        })?
        .map_err(ApiError::from)
}

/// Interprets the ingest body: raw gzip bytes, or base64 of them.
fn decode_bundle_body(body: &[u8]) -> Option<Vec<u8>> {
    if body.is_empty() {
        return None;
    }
    if looks_like_gzip(body) {
        return Some(body.to_vec());
    }
    let text: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let decoded = BASE64.decode(&text).ok()?;
    looks_like_gzip(&decoded).then_some(decoded)
}

async fn ingest_bundle(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let Some(bytes) = decode_bundle_body(&body) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "missing or undecodable bundle body",
        ));
    };
    let orchestrator = Arc::clone(&state.orchestrator);
    let bundle_id = blocking(move || orchestrator.ingest(&bytes)).await?;
    Ok((StatusCode::CREATED, axum::Json(json!({ "bundleId": bundle_id }))))
}

async fn list_bundles(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let rows = blocking(move || orchestrator.list()).await?;
    let bundles: Vec<Value> = rows
        .into_iter()
        .map(|(row, status, approval)| {
            let mut entry = json!({
                "id": row.id,
                "createdAt": row.created_at,
                "status": status,
            });
            if let Some(approval) = approval {
                entry["approval"] = serde_json::to_value(approval).unwrap_or(Value::Null);
            }
            entry
        })
        .collect();
    Ok(axum::Json(json!({ "bundles": bundles })))
}

async fn plan_bundle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let plan = blocking(move || orchestrator.plan(&id)).await?;
    Ok(axum::Json(serde_json::to_value(plan).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct ApproveBody {
    #[serde(default)]
    actor: Option<String>,
    /// Accepted for compatibility; the recorded version is always the
    /// currently loaded policy's.
    #[serde(rename = "policyVersion", default)]
    _policy_version: Option<String>,
}

async fn approve_bundle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let actor = serde_json::from_slice::<ApproveBody>(&body)
        .ok()
        .and_then(|parsed| parsed.actor)
        .filter(|actor| !actor.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "missing actor"))?;

    let orchestrator = Arc::clone(&state.orchestrator);
    let bundle_id = id.clone();
    let approval = blocking(move || orchestrator.approve(&bundle_id, &actor)).await?;
    Ok(axum::Json(json!({
        "status": "approved",
        "bundleId": id,
        "approval": approval,
    })))
}

async fn commit_bundle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let receipts =
        blocking(move || orchestrator.commit(&id, &OpContext::background())).await?;
    Ok(axum::Json(json!({
        "status": "committed",
        "receipts": receipts,
    })))
}

async fn revert_bundle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let results =
        blocking(move || orchestrator.revert(&id, &OpContext::background())).await?;
    Ok(axum::Json(json!({
        "status": "reverted",
        "results": results,
    })))
}
