//! Inter-node endpoints: the follower's worker surface and the leader's
//! progress callback. Every request carries the salted-hash auth header,
//! verified against the raw body before anything is parsed.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use frameshift_core::auth;
use frameshift_core::executor::ProgressEvent;
use frameshift_core::store::types::JobId;
use frameshift_core::system;
use frameshift_core::wire::{WorkerCancelResponse, WorkerExecuteRequest, WorkerStatusResponse};

use super::{ApiError, AppState};

fn verify_auth(state: &AppState, headers: &HeaderMap, payload: &[u8]) -> Result<(), ApiError> {
    let Some(token) = state.config.shared_token.as_deref() else {
        return Err(ApiError::unauthorized());
    };
    let Some(header) = headers
        .get(auth::AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(ApiError::unauthorized());
    };
    if auth::verify(payload, header, token) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

/// `POST /worker/execute`: run one dispatched job; the response is held open
/// until the encode finishes.
pub async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_auth(&state, &headers, &body)?;
    let request: WorkerExecuteRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("malformed execute request: {e}")))?;
    let Some(follower) = &state.follower else {
        return Err(ApiError::not_found("not a follower node"));
    };

    let response = follower.execute_dispatch(request).await;
    Ok(Json(serde_json::to_value(response).unwrap_or_else(|_| json!({"success": false}))))
}

/// `POST /worker/cancel/:jobId`: cancel a dispatched job by the leader's id.
pub async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WorkerCancelResponse>, ApiError> {
    verify_auth(&state, &headers, &body)?;
    let Some(follower) = &state.follower else {
        return Err(ApiError::not_found("not a follower node"));
    };
    if follower.cancel_dispatch(job_id).await {
        Ok(Json(WorkerCancelResponse { cancelled: true }))
    } else {
        Err(ApiError::not_found(format!("job {job_id} not running here")))
    }
}

/// `GET /worker/status`: liveness probe plus the active dispatch set.
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WorkerStatusResponse>, ApiError> {
    verify_auth(&state, &headers, b"")?;
    let Some(follower) = &state.follower else {
        return Err(ApiError::not_found("not a follower node"));
    };
    Ok(Json(WorkerStatusResponse {
        worker_id: follower.worker_id().to_string(),
        busy: follower.busy(),
        active_jobs: follower.active_jobs(),
    }))
}

/// `GET /worker/system-status`: CPU/memory snapshot for the cluster UI.
pub async fn system_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<system::SystemStatus>, ApiError> {
    verify_auth(&state, &headers, b"")?;
    Ok(Json(system::sample(&state.config.worker_id()).await))
}

/// `POST /api/jobs/:id/progress`: follower→leader progress callback, routed
/// into the distributor.
pub async fn job_progress(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_auth(&state, &headers, &body)?;
    let event: ProgressEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("malformed progress body: {e}")))?;
    let Some(distributor) = &state.distributor else {
        return Err(ApiError::not_found("not a leader node"));
    };
    if distributor.handle_progress(job_id, event).await? {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::not_found(format!("job {job_id} not found")))
    }
}
