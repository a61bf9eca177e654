use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use chatty_queue::BoardError;

pub fn board_error_to_response(err: BoardError) -> axum::response::Response {
    match err {
        BoardError::QueueNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "queue_not_found", err.to_string())
        }
        BoardError::JobNotFound { .. } => {
            json_error(StatusCode::NOT_FOUND, "job_not_found", err.to_string())
        }
        BoardError::Store(e) => {
            tracing::error!(error = %e, "board query failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
