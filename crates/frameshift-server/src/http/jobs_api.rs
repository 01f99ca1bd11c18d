//! Client-facing job endpoints: cursor-paginated listing, multi-file
//! submission, bulk actions, and single-job actions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

use frameshift_core::cursor::Cursor;
use frameshift_core::events::Event;
use frameshift_core::store::types::{EncoderCommand, JobId, JobStatus, NewJob};

use super::{ApiError, AppState};

const DEFAULT_PAGE_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    cursor: Option<String>,
    limit: Option<i64>,
    status: Option<String>,
    #[serde(default)]
    include_cleared: bool,
}

/// `GET /api/jobs`: default listing (queue section then finished section)
/// behind opaque cursors, or a flat per-status view when `status` is given.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(status) = query.status.as_deref() {
        let parsed = match status {
            "pending" | "processing" | "completed" | "failed" | "cancelled" => {
                JobStatus::parse(status)
            }
            other => return Err(ApiError::bad_request(format!("unknown status {other:?}"))),
        };
        let jobs = state.store.get_jobs_by_status(parsed).await?;
        return Ok(Json(json!({ "jobs": jobs })));
    }

    let cursor = match query.cursor.as_deref() {
        None | Some("") => None,
        Some(raw) => match Cursor::decode(raw) {
            Some(cursor) => Some(cursor),
            None => return Err(ApiError::bad_request("malformed cursor")),
        },
    };

    let page = state
        .store
        .get_paginated(
            query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            cursor,
            query.include_cleared,
        )
        .await?;

    Ok(Json(json!({
        "jobs": page.jobs,
        "hasMore": page.has_more,
        "nextCursor": page.next_cursor.map(|c| c.encode()),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub files: Vec<String>,
    #[serde(default)]
    pub ffmpeg_args: Vec<String>,
    pub output_extension: Option<String>,
    pub config: Option<serde_json::Value>,
    pub picker_state: Option<serde_json::Value>,
}

/// `POST /api/jobs`: validate paths against the media root, snapshot the
/// configuration, append jobs to the queue tail, and wake the processor.
pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if request.files.is_empty() {
        return Err(ApiError::bad_request("no input files"));
    }

    let media_root = tokio::fs::canonicalize(&state.config.media_root)
        .await
        .unwrap_or_else(|_| state.config.media_root.clone());

    // Resolve and contain every input before touching the store.
    let mut inputs: Vec<PathBuf> = Vec::with_capacity(request.files.len());
    for file in &request.files {
        let candidate = {
            let p = PathBuf::from(file);
            if p.is_absolute() { p } else { media_root.join(p) }
        };
        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|_| ApiError::bad_request(format!("input not found: {file}")))?;
        if !resolved.starts_with(&media_root) {
            return Err(ApiError::bad_request(format!(
                "input outside media root: {file}"
            )));
        }
        inputs.push(resolved);
    }

    let config_json = request.config.clone().unwrap_or_else(|| json!({}));
    let input_strings: Vec<String> = inputs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let config_key = state
        .store
        .put_config_blob(&input_strings, &config_json, request.picker_state.as_ref())
        .await?;
    let batch_id = state
        .store
        .create_batch(inputs.len() as i64, Some(&config_key))
        .await?;

    let extension = request.output_extension.as_deref().unwrap_or("mp4");
    let base_position = state.store.get_max_queue_position().await?.map_or(0, |m| m + 1);

    let mut job_ids: Vec<JobId> = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("job-{index}"));
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("output-{index}"));
        let output_path = state.config.output_dir.join(format!("{stem}.{extension}"));

        let new = NewJob {
            name,
            input_file: input.to_string_lossy().into_owned(),
            output_file: Some(output_path.to_string_lossy().into_owned()),
            command: EncoderCommand {
                args: request.ffmpeg_args.clone(),
                input_path: input.to_string_lossy().into_owned(),
                output_path: output_path.to_string_lossy().into_owned(),
                duration_seconds: None,
            },
            queue_position: Some(base_position + index as i64),
            total_frames: None,
            config_key: Some(config_key.clone()),
            config_json: request.config.clone(),
        };
        let id = state.store.create_job(&new).await?;
        state.store.bump_batch_created(batch_id).await?;
        if let Some(job) = state.store.get_job(id).await? {
            state.bus.publish(Event::JobCreated(job));
        }
        job_ids.push(id);
    }
    state.store.finish_batch(batch_id, None).await?;
    publish_counts(&state).await;
    state.processor.trigger();

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "jobIds": job_ids,
            "batchId": batch_id,
            "configKey": config_key,
        })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAction {
    action: String,
    #[serde(default)]
    ids: Vec<JobId>,
}

/// `PUT /api/jobs`: `retry-all-failed`, `clear-finished`, or `reorder`.
pub async fn bulk_action(
    State(state): State<AppState>,
    Json(body): Json<BulkAction>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match body.action.as_str() {
        "retry-all-failed" => {
            let new_ids = state.store.retry_all_failed().await?;
            for &id in &new_ids {
                if let Some(job) = state.store.get_job(id).await? {
                    state.bus.publish(Event::JobCreated(job));
                }
            }
            publish_counts(&state).await;
            state.processor.trigger();
            Ok(Json(json!({ "retried": new_ids.len(), "jobIds": new_ids })))
        }
        "clear-finished" => {
            let cleared = state.store.clear_all_finished_jobs().await?;
            state.bus.publish(Event::JobsCleared {});
            publish_counts(&state).await;
            Ok(Json(json!({ "cleared": cleared })))
        }
        "reorder" => {
            if body.ids.is_empty() {
                return Err(ApiError::bad_request("reorder requires ids"));
            }
            state.store.reorder_queue(&body.ids).await?;
            publish_counts(&state).await;
            Ok(Json(json!({ "ok": true })))
        }
        other => Err(ApiError::bad_request(format!("unknown action {other:?}"))),
    }
}

/// `DELETE /api/jobs`: cancel every pending and processing job.
pub async fn cancel_all(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pending = state.store.cancel_pending_jobs().await?;
    for &id in &pending {
        if let Some(job) = state.store.get_job(id).await? {
            state.bus.publish(Event::JobUpdated(job));
        }
    }

    let processing = state.store.get_jobs_by_status(JobStatus::Processing).await?;
    let mut cancelled = pending.len();
    for job in processing {
        if cancel_processing_job(&state, job.id).await? {
            cancelled += 1;
        }
    }
    publish_counts(&state).await;
    Ok(Json(json!({ "cancelled": cancelled })))
}

/// `GET /api/jobs/:id`.
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.store.get_job(id).await? {
        Some(job) => Ok(Json(json!({ "job": job }))),
        None => Err(ApiError::not_found(format!("job {id} not found"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobAction {
    action: String,
}

/// `PATCH /api/jobs/:id`: `retry` or `cancel`.
pub async fn patch_one(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(body): Json<JobAction>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(job) = state.store.get_job(id).await? else {
        return Err(ApiError::not_found(format!("job {id} not found")));
    };

    match body.action.as_str() {
        "retry" => match state.store.retry_job(id).await? {
            Some(new_id) => {
                if let Some(fresh) = state.store.get_job(new_id).await? {
                    state.bus.publish(Event::JobCreated(fresh));
                }
                if let Some(original) = state.store.get_job(id).await? {
                    state.bus.publish(Event::JobUpdated(original));
                }
                publish_counts(&state).await;
                state.processor.trigger();
                Ok(Json(json!({ "newJobId": new_id })))
            }
            None => Err(ApiError::bad_request(
                "only failed or cancelled jobs can be retried",
            )),
        },
        "cancel" => match job.status {
            JobStatus::Pending => {
                state.store.cancel_job(id, "cancelled by user").await?;
                if let Some(fresh) = state.store.get_job(id).await? {
                    state.bus.publish(Event::JobUpdated(fresh));
                }
                publish_counts(&state).await;
                Ok(Json(json!({ "status": "cancelled" })))
            }
            JobStatus::Processing => {
                if cancel_processing_job(&state, id).await? {
                    Ok(Json(json!({ "status": "cancelling" })))
                } else {
                    Err(ApiError::bad_request("job is not cancellable right now"))
                }
            }
            _ => Err(ApiError::bad_request("job already finished")),
        },
        other => Err(ApiError::bad_request(format!("unknown action {other:?}"))),
    }
}

/// `GET /api/jobs/batches/:id`: submission bookkeeping.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.store.get_batch(id).await? {
        Some(batch) => Ok(Json(json!({ "batch": batch }))),
        None => Err(ApiError::not_found(format!("batch {id} not found"))),
    }
}

/// Cancel one processing job: through the local processor when it holds the
/// job, else (leader) through the follower holding it.
async fn cancel_processing_job(state: &AppState, id: JobId) -> Result<bool, ApiError> {
    if state.processor.cancel_job(id) {
        return Ok(true);
    }
    if let Some(distributor) = &state.distributor {
        // A job re-attached after restart has no live executor; settle the row
        // once the follower acknowledges.
        if distributor.cancel_job_on_follower(id).await {
            state.store.cancel_job(id, "cancelled by user").await?;
            if let Some(fresh) = state.store.get_job(id).await? {
                state.bus.publish(Event::JobUpdated(fresh));
            }
            return Ok(true);
        }
    }
    Ok(false)
}

async fn publish_counts(state: &AppState) {
    if let Ok(counts) = state.store.get_status_counts().await {
        state.bus.publish(Event::StatusCounts(counts));
    }
}
