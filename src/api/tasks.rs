use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::error::{error_response, internal_error, scheduler_error};
use super::HostState;
use crate::db::tasks as task_store;
use crate::protocol::{SubmitRequest, TaskStatusUpdate};
use crate::scheduler::state::TaskType;

pub fn routes() -> Router<Arc<HostState>> {
    Router::new()
        .route("/api/submit", post(submit))
        .route("/api/status/{task_id}", get(status))
        .route("/api/tasks", get(list_tasks))
        .route("/api/kill/{task_id}", post(kill))
        .route("/api/command/{task_id}/{action}", post(command))
        .route("/api/approve/{task_id}", post(approve))
        .route("/api/reject/{task_id}", post(reject))
        .route("/api/update", post(update))
}

/// Submit a command task. VPS sessions go through `/api/vps/create`, which
/// dispatches synchronously; plain commands are queued for the dispatcher.
async fn submit(
    State(state): State<Arc<HostState>>,
    Json(req): Json<SubmitRequest>,
) -> Response {
    if req.task_type == TaskType::Vps {
        return error_response(
            StatusCode::BAD_REQUEST,
            "vps tasks are created via /api/vps/create",
        );
    }
    match state.scheduler.submit(req).await {
        Ok(resp) => (StatusCode::CREATED, Json(resp)).into_response(),
        Err(e) => scheduler_error("submit", e),
    }
}

async fn status(State(state): State<Arc<HostState>>, Path(task_id): Path<i64>) -> Response {
    match task_store::get(&state.scheduler.db.pool, task_id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("task {task_id} not found")),
        Err(e) => internal_error("status", e),
    }
}

async fn list_tasks(State(state): State<Arc<HostState>>) -> Response {
    match task_store::list(&state.scheduler.db.pool).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => internal_error("list_tasks", e),
    }
}

async fn kill(State(state): State<Arc<HostState>>, Path(task_id): Path<i64>) -> Response {
    match state.scheduler.kill(task_id).await {
        Ok(task) => {
            state.ssh_proxy.release(task_id).await;
            Json(task).into_response()
        }
        Err(e) => scheduler_error("kill", e),
    }
}

async fn command(
    State(state): State<Arc<HostState>>,
    Path((task_id, action)): Path<(i64, String)>,
) -> Response {
    let result = match action.as_str() {
        "pause" => state.scheduler.pause(task_id).await,
        "resume" => state.scheduler.resume(task_id).await,
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown command {other:?}, expected pause or resume"),
            )
        }
    };
    match result {
        Ok(task) => Json(task).into_response(),
        Err(e) => scheduler_error("command", e),
    }
}

async fn approve(State(state): State<Arc<HostState>>, Path(task_id): Path<i64>) -> Response {
    match state.scheduler.approve(task_id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => scheduler_error("approve", e),
    }
}

#[derive(Deserialize, Default)]
struct RejectBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn reject(
    State(state): State<Arc<HostState>>,
    Path(task_id): Path<i64>,
    body: axum::body::Bytes,
) -> Response {
    // The body is optional; an empty one means "no reason given".
    let reason = serde_json::from_slice::<RejectBody>(&body)
        .ok()
        .and_then(|b| b.reason);
    match state.scheduler.reject(task_id, reason).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => scheduler_error("reject", e),
    }
}

/// Runner status callback. Terminal updates also tear down the task's SSH
/// proxy listener.
async fn update(
    State(state): State<Arc<HostState>>,
    Json(update): Json<TaskStatusUpdate>,
) -> Response {
    let task_id = update.task_id;
    let terminal = update.status.is_terminal();
    match state.scheduler.handle_update(update).await {
        Ok(_) => {
            if terminal {
                state.ssh_proxy.release(task_id).await;
            }
            StatusCode::OK.into_response()
        }
        Err(e) => scheduler_error("update", e),
    }
}
