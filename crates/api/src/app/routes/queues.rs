//! Read-only queue board.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;

use chatty_core::JobId;
use chatty_queue::{JobStatus, QueueRegistry};

use crate::app::errors;

const DEFAULT_JOB_LIMIT: usize = 50;
const MAX_JOB_LIMIT: usize = 1000;

pub fn router() -> Router {
    Router::new()
        .route("/", get(overview))
        .route("/:queue", get(queue_summary))
        .route("/:queue/jobs", get(list_jobs))
        .route("/:queue/jobs/:id", get(get_job))
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn overview(Extension(registry): Extension<Arc<QueueRegistry>>) -> axum::response::Response {
    let board = registry.board();
    match board.overview().await {
        Ok(queues) => Json(serde_json::json!({ "queues": queues })).into_response(),
        Err(e) => errors::board_error_to_response(e),
    }
}

pub async fn queue_summary(
    Extension(registry): Extension<Arc<QueueRegistry>>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    match registry.board().summary(&queue).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::board_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(registry): Extension<Arc<QueueRegistry>>,
    Path(queue): Path<String>,
    Query(query): Query<JobListQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref().map(str::parse::<JobStatus>).transpose() {
        Ok(status) => status,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string()),
    };
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT).min(MAX_JOB_LIMIT);

    match registry.board().jobs(&queue, status, limit).await {
        Ok(jobs) => Json(serde_json::json!({
            "queue": queue,
            "count": jobs.len(),
            "jobs": jobs,
        }))
        .into_response(),
        Err(e) => errors::board_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(registry): Extension<Arc<QueueRegistry>>,
    Path((queue, id)): Path<(String, String)>,
) -> axum::response::Response {
    let id = match id.parse::<JobId>() {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_id", e.to_string()),
    };

    match registry.board().job(&queue, id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::board_error_to_response(e),
    }
}
