use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use super::error::{error_response, internal_error};
use super::HostState;
use crate::config::detect_physical_ip;
use crate::db::nodes as node_store;
use crate::overlay::VXLAN_UDP_PORT;
use crate::protocol::{HeartbeatPayload, RegisterRequest, RegisterResponse};
use crate::scheduler::SchedulerError;

pub fn routes() -> Router<Arc<HostState>> {
    Router::new()
        .route("/api/register", post(register))
        .route("/api/heartbeat/{hostname}", put(heartbeat))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/{hostname}", get(get_node))
}

/// Runner registration. Idempotent on hostname; allocates (or re-validates)
/// the node's overlay slot and returns the assignment.
async fn register(
    State(state): State<Arc<HostState>>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if req.hostname.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "hostname must not be empty");
    }
    let physical_ip: std::net::Ipv4Addr = match req.physical_ip.parse() {
        Ok(ip) => ip,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("physical_ip {:?} is not an IPv4 address", req.physical_ip),
            )
        }
    };

    if let Err(e) = node_store::upsert(&state.scheduler.db.pool, &req).await {
        return internal_error("register", e);
    }
    state.scheduler.registry.register(&req).await;

    // The address this Host is reachable at *from that runner* — the
    // runner points its VXLAN remote here.
    let host_physical_ip = detect_physical_ip(&req.physical_ip, VXLAN_UDP_PORT)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|e| {
            warn!(error = %e, "Could not derive host physical IP");
            String::new()
        });

    let online = state.scheduler.registry.online_names().await;
    let overlay = match state
        .scheduler
        .overlay
        .register_runner(&req.hostname, physical_ip, &host_physical_ip, &online)
        .await
    {
        Ok(assignment) => Some(assignment),
        Err(e) => {
            warn!(node = %req.hostname, error = %e, "Overlay allocation failed");
            None
        }
    };

    info!(node = %req.hostname, overlay = overlay.is_some(), "Runner registered");
    Json(RegisterResponse {
        hostname: req.hostname,
        overlay,
    })
    .into_response()
}

/// Node heartbeat: liveness + health + task reconciliation. 404 tells the
/// runner it must re-register (the Host restarted, or it was never known).
async fn heartbeat(
    State(state): State<Arc<HostState>>,
    Path(hostname): Path<String>,
    Json(payload): Json<HeartbeatPayload>,
) -> Response {
    match state.scheduler.process_heartbeat(&hostname, payload).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(SchedulerError::Validation(_)) => {
            error_response(StatusCode::NOT_FOUND, format!("unknown node {hostname}"))
        }
        Err(e) => internal_error("heartbeat", e),
    }
}

#[derive(Serialize)]
struct NodeView {
    hostname: String,
    url: String,
    status: String,
    total_cores: i64,
    available_cores: u32,
    memory_total_bytes: i64,
    vm_capable: bool,
    last_heartbeat: Option<String>,
    health: Option<HeartbeatPayload>,
}

async fn list_nodes(State(state): State<Arc<HostState>>) -> Response {
    let records = match node_store::list(&state.scheduler.db.pool).await {
        Ok(r) => r,
        Err(e) => return internal_error("list_nodes", e),
    };
    let mut views = Vec::with_capacity(records.len());
    for record in records {
        let snapshot = state.scheduler.registry.snapshot_of(&record.hostname).await;
        let health = state.scheduler.registry.health_of(&record.hostname).await;
        views.push(NodeView {
            available_cores: snapshot.as_ref().map(|s| s.available_cores()).unwrap_or(0),
            status: if snapshot.as_ref().is_some_and(|s| s.online) {
                "online".into()
            } else {
                "offline".into()
            },
            hostname: record.hostname,
            url: record.url,
            total_cores: record.total_cores,
            memory_total_bytes: record.memory_total_bytes,
            vm_capable: record.vm_capable,
            last_heartbeat: record.last_heartbeat,
            health,
        });
    }
    Json(views).into_response()
}

async fn get_node(
    State(state): State<Arc<HostState>>,
    Path(hostname): Path<String>,
) -> Response {
    match node_store::get(&state.scheduler.db.pool, &hostname).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("unknown node {hostname}")),
        Err(e) => internal_error("get_node", e),
    }
}
