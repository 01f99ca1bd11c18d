//! HTTP surface: client job API, inter-node worker API, WebSocket push.

pub mod jobs_api;
pub mod worker_api;
pub mod ws;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

use frameshift_core::config::{InstanceType, NodeConfig};
use frameshift_core::distributor::Distributor;
use frameshift_core::events::EventBus;
use frameshift_core::follower::FollowerWorker;
use frameshift_core::processor::ProcessorHandle;
use frameshift_core::runtime::NodeRuntime;
use frameshift_core::store::Store;

/// Shared handler state, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub store: Store,
    pub bus: Arc<EventBus>,
    pub processor: ProcessorHandle,
    pub distributor: Option<Arc<Distributor>>,
    pub follower: Option<Arc<FollowerWorker>>,
}

impl AppState {
    pub fn from_runtime(runtime: &NodeRuntime) -> Self {
        Self {
            config: Arc::new(runtime.config.clone()),
            store: runtime.store.clone(),
            bus: Arc::clone(&runtime.bus),
            processor: runtime.processor.clone(),
            distributor: runtime.distributor.clone(),
            follower: runtime.follower.clone(),
        }
    }
}

/// Build the router for this node's mode. Followers expose only the
/// leader-authenticated worker surface; leaders add the progress callback
/// endpoint to the client API.
pub fn router(state: AppState) -> Router {
    match state.config.instance_type {
        InstanceType::Follower => Router::new()
            .route("/worker/execute", post(worker_api::execute))
            .route("/worker/cancel/:job_id", post(worker_api::cancel))
            .route("/worker/status", get(worker_api::status))
            .route("/worker/system-status", get(worker_api::system_status))
            .with_state(state),
        InstanceType::Leader => client_router()
            .route("/api/jobs/:id/progress", post(worker_api::job_progress))
            .with_state(state),
        InstanceType::Standalone => client_router().with_state(state),
    }
}

fn client_router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/jobs",
            get(jobs_api::list)
                .post(jobs_api::submit)
                .put(jobs_api::bulk_action)
                .delete(jobs_api::cancel_all),
        )
        .route("/api/jobs/:id", get(jobs_api::get_one).patch(jobs_api::patch_one))
        .route("/api/jobs/batches/:id", get(jobs_api::get_batch))
        .route("/api/ws", get(ws::upgrade))
}

/// API error: status code plus `{error, details?}` body. Auth failures carry
/// no detail at all.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into(), details: None }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into(), details: None }
    }

    pub fn unauthorized() -> Self {
        Self { status: StatusCode::UNAUTHORIZED, message: String::new(), details: None }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
            details: Some(format!("{err:#}")),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status == StatusCode::UNAUTHORIZED {
            // No detail on auth failures.
            return self.status.into_response();
        }
        let body = serde_json::json!({
            "error": self.message,
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}
