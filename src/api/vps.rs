use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{error_response, internal_error, scheduler_error};
use super::HostState;
use crate::db::tasks as task_store;
use crate::protocol::{SnapshotCreateRequest, SubmitRequest, VpsCreateResponse};
use crate::scheduler::state::{TaskStatus, TaskType};
use crate::scheduler::Scheduler;

pub fn routes() -> Router<Arc<HostState>> {
    Router::new()
        .route("/api/vps/create", post(create))
        .route("/api/vps/stop/{task_id}", post(stop))
        .route("/api/vps/restart/{task_id}", post(restart))
        .route(
            "/api/vps/snapshots/{task_id}",
            get(snapshots_list)
                .post(snapshots_create)
                .delete(snapshots_delete),
        )
}

#[derive(Serialize)]
struct VpsCreated {
    task_id: i64,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssh_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_ssh_port: Option<u16>,
    /// Present exactly once for generated keys; the Host never stores it.
    #[serde(skip_serializing_if = "Option::is_none")]
    ssh_private_key: Option<String>,
}

/// Create a VPS session: submit, dispatch synchronously, and (for
/// SSH-enabled sessions) wire up the Host-side SSH proxy port.
async fn create(
    State(state): State<Arc<HostState>>,
    Json(mut req): Json<SubmitRequest>,
) -> Response {
    req.task_type = TaskType::Vps;
    let submitted = match state.scheduler.submit(req).await {
        Ok(resp) => resp,
        Err(e) => return scheduler_error("vps_create", e),
    };
    // Approval-gated submissions stop here; dispatch happens after approval.
    if submitted.status == TaskStatus::PendingApproval {
        return (
            StatusCode::ACCEPTED,
            Json(VpsCreated {
                task_id: submitted.task_id,
                status: submitted.status,
                ip: None,
                ssh_port: None,
                host_ssh_port: None,
                ssh_private_key: None,
            }),
        )
            .into_response();
    }

    let task = match task_store::get(&state.scheduler.db.pool, submitted.task_id).await {
        Ok(Some(t)) => t,
        Ok(None) => return internal_error("vps_create", "task vanished after submit"),
        Err(e) => return internal_error("vps_create", e),
    };

    let runner_resp = match state.scheduler.dispatch_vps(&task).await {
        Ok(r) => r,
        Err(e) => return scheduler_error("vps_dispatch", e),
    };

    let host_ssh_port =
        expose_ssh(&state, &state.scheduler, submitted.task_id, &runner_resp).await;

    (
        StatusCode::ACCEPTED,
        Json(VpsCreated {
            task_id: submitted.task_id,
            status: TaskStatus::Assigning,
            ip: runner_resp.ip,
            ssh_port: runner_resp.ssh_port,
            host_ssh_port,
            ssh_private_key: runner_resp.ssh_private_key,
        }),
    )
        .into_response()
}

async fn expose_ssh(
    state: &HostState,
    scheduler: &Scheduler,
    task_id: i64,
    runner_resp: &VpsCreateResponse,
) -> Option<u16> {
    let ssh_port = runner_resp.ssh_port?;
    let task = task_store::get(&scheduler.db.pool, task_id).await.ok()??;
    let node = task.assigned_node.as_deref()?;
    let runner_url = scheduler.registry.url_of(node).await?;
    let container_id = Scheduler::container_id_for(&task);

    match state
        .ssh_proxy
        .expose(task_id, &runner_url, &container_id, ssh_port)
        .await
    {
        Ok(host_port) => {
            let _ = task_store::set_ssh_ports(
                &scheduler.db.pool,
                task_id,
                Some(ssh_port),
                Some(host_port),
            )
            .await;
            Some(host_port)
        }
        Err(e) => {
            warn!(task = task_id, error = %e, "SSH proxy exposure failed");
            None
        }
    }
}

#[derive(Deserialize, Default)]
struct StopQuery {
    #[serde(default)]
    snapshot: bool,
}

async fn stop(
    State(state): State<Arc<HostState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<StopQuery>,
) -> Response {
    match state.scheduler.vps_stop(task_id, q.snapshot).await {
        Ok(task) => {
            state.ssh_proxy.release(task_id).await;
            Json(task).into_response()
        }
        Err(e) => scheduler_error("vps_stop", e),
    }
}

#[derive(Deserialize, Default)]
struct RestartQuery {
    #[serde(default)]
    from_snapshot: bool,
}

async fn restart(
    State(state): State<Arc<HostState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<RestartQuery>,
) -> Response {
    match state.scheduler.vps_restart(task_id, q.from_snapshot).await {
        Ok(runner_resp) => {
            let host_ssh_port =
                expose_ssh(&state, &state.scheduler, task_id, &runner_resp).await;
            Json(VpsCreated {
                task_id,
                status: TaskStatus::Assigning,
                ip: runner_resp.ip,
                ssh_port: runner_resp.ssh_port,
                host_ssh_port,
                ssh_private_key: None,
            })
            .into_response()
        }
        Err(e) => scheduler_error("vps_restart", e),
    }
}

// ---- snapshots: thin proxies to the owning runner ----

async fn runner_base_for(state: &HostState, task_id: i64) -> Result<String, Response> {
    let task = match task_store::get(&state.scheduler.db.pool, task_id).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            return Err(error_response(
                StatusCode::NOT_FOUND,
                format!("task {task_id} not found"),
            ))
        }
        Err(e) => return Err(internal_error("snapshots", e)),
    };
    let node = task.assigned_node.as_deref().ok_or_else(|| {
        error_response(StatusCode::CONFLICT, "task has no assigned node")
    })?;
    state
        .scheduler
        .registry
        .url_of(node)
        .await
        .map(|u| u.trim_end_matches('/').to_string())
        .ok_or_else(|| error_response(StatusCode::BAD_GATEWAY, format!("node {node} offline")))
}

async fn proxy_json(req: reqwest::RequestBuilder) -> Response {
    match req.send().await {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            match resp.json::<serde_json::Value>().await {
                Ok(body) => (status, Json(body)).into_response(),
                Err(_) => status.into_response(),
            }
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}

async fn snapshots_list(State(state): State<Arc<HostState>>, Path(task_id): Path<i64>) -> Response {
    let base = match runner_base_for(&state, task_id).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    proxy_json(state.http.get(format!("{base}/api/vps/snapshots/{task_id}"))).await
}

async fn snapshots_create(
    State(state): State<Arc<HostState>>,
    Path(task_id): Path<i64>,
    Json(body): Json<SnapshotCreateRequest>,
) -> Response {
    let base = match runner_base_for(&state, task_id).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    proxy_json(
        state
            .http
            .post(format!("{base}/api/vps/snapshots/{task_id}"))
            .json(&body),
    )
    .await
}

#[derive(Deserialize)]
struct SnapshotDeleteQuery {
    tag: String,
}

async fn snapshots_delete(
    State(state): State<Arc<HostState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<SnapshotDeleteQuery>,
) -> Response {
    let base = match runner_base_for(&state, task_id).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    proxy_json(state.http.delete(format!(
        "{base}/api/vps/snapshots/{task_id}?tag={}",
        q.tag
    )))
    .await
}

