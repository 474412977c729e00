use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::scheduler::SchedulerError;

/// Return a generic 500 response, logging the real error server-side.
pub fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    error!(context = context, error = %err, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "Internal server error" })),
    )
        .into_response()
}

/// Error response with a caller-visible message.
pub fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
        .into_response()
}

/// Map scheduler errors onto HTTP statuses: validation problems are the
/// caller's (400), missing tasks 404, placement and runner trouble 502/409,
/// everything else a logged 500.
pub fn scheduler_error(context: &str, err: SchedulerError) -> Response {
    match err {
        SchedulerError::Validation(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        SchedulerError::NotFound(id) => {
            error_response(StatusCode::NOT_FOUND, format!("task {id} not found"))
        }
        SchedulerError::WrongState(status) => error_response(
            StatusCode::CONFLICT,
            format!("operation not valid while task is {status}"),
        ),
        SchedulerError::NoSuitableNode(reason) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, reason)
        }
        SchedulerError::RunnerUnreachable(reason) => {
            error_response(StatusCode::BAD_GATEWAY, reason)
        }
        SchedulerError::Internal(e) => internal_error(context, e),
    }
}
