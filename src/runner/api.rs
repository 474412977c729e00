use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::vm::vm_container_id;
use super::{fs as fsops, RunnerState};
use crate::protocol::{
    ExecuteRequest, SnapshotCreateRequest, VmHeartbeat, VmPhoneHome, VpsCreateRequest,
};
use crate::scheduler::state::VpsBackend;
use crate::tunnel::frame::TunnelProto;

pub fn router(state: Arc<RunnerState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/execute", post(execute))
        .route("/api/kill/{task_id}", post(kill))
        .route("/api/pause/{task_id}", post(pause))
        .route("/api/resume/{task_id}", post(resume))
        .route("/api/vps/create", post(vps_create))
        .route("/api/vps/stop/{task_id}", post(vps_stop))
        .route("/api/vps/restart/{task_id}", post(vps_restart))
        .route("/api/vps/pause/{task_id}", post(vps_pause))
        .route("/api/vps/resume/{task_id}", post(vps_resume))
        .route(
            "/api/vps/snapshots/{task_id}",
            get(snapshots_list)
                .post(snapshots_create)
                .delete(snapshots_delete),
        )
        .route("/api/vps/{task_id}/vm-phone-home", post(vm_phone_home))
        .route("/api/vps/{task_id}/vm-heartbeat", post(vm_heartbeat))
        .route("/api/vm/images", get(vm_images))
        .route("/api/fs/{task_id}/list", get(fs_list))
        .route("/api/fs/{task_id}/read", get(fs_read))
        .route("/api/fs/{task_id}/write", post(fs_write))
        .route("/api/fs/{task_id}/mkdir", post(fs_mkdir))
        .route("/api/fs/{task_id}/rename", post(fs_rename))
        .route("/api/fs/{task_id}/delete", delete(fs_delete))
        .route("/api/fs/{task_id}/stat", get(fs_stat))
        .route("/ws/tunnel/{container_id}", get(ws_tunnel))
        .route("/ws/forward/{container_id}/{port}", get(ws_forward))
        // Filesystem writes accept up to 50 MiB; everything else is far
        // below the limit.
        .layer(axum::extract::DefaultBodyLimit::max(
            super::fs::MAX_WRITE_BYTES + 4096,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

// ---- task lifecycle ----

async fn execute(
    State(state): State<Arc<RunnerState>>,
    Json(req): Json<ExecuteRequest>,
) -> Response {
    info!(task = req.task_id, command = %req.command, "Execute request");
    state.executor.spawn_execute(req);
    StatusCode::ACCEPTED.into_response()
}

async fn kill(State(state): State<Arc<RunnerState>>, Path(task_id): Path<i64>) -> Response {
    let result = if state.vm.vm_ip_of(task_id).await.is_some() {
        state.vm.stop(task_id).await
    } else if state.vps.running_task_ids().await.contains(&task_id) {
        state.vps.kill(task_id).await
    } else {
        state.executor.kill(task_id).await
    };
    match result {
        Ok(()) => {
            // Also reported in the next heartbeat's killed set, in case the
            // synchronous acknowledgment is lost.
            state.note_killed(task_id).await;
            StatusCode::OK.into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn pause(State(state): State<Arc<RunnerState>>, Path(task_id): Path<i64>) -> Response {
    let result = match state.executor.pause(task_id).await {
        Ok(()) => Ok(()),
        Err(_) => state.vps.pause(task_id).await,
    };
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

async fn resume(State(state): State<Arc<RunnerState>>, Path(task_id): Path<i64>) -> Response {
    let result = match state.executor.resume(task_id).await {
        Ok(()) => Ok(()),
        Err(_) => state.vps.resume(task_id).await,
    };
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

// ---- VPS ----

async fn vps_create(
    State(state): State<Arc<RunnerState>>,
    Json(req): Json<VpsCreateRequest>,
) -> Response {
    info!(task = req.task_id, backend = %req.backend, "VPS create request");
    let result = match req.backend {
        VpsBackend::Docker => state.vps.create(req).await,
        VpsBackend::Qemu => state.vm.create(req).await,
    };
    match result {
        Ok(resp) => (StatusCode::ACCEPTED, Json(resp)).into_response(),
        Err(e) => {
            warn!(error = %e, "VPS create failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

#[derive(Deserialize, Default)]
struct StopQuery {
    #[serde(default)]
    snapshot: bool,
}

async fn vps_stop(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<StopQuery>,
) -> Response {
    let result = if state.vm.vm_ip_of(task_id).await.is_some() {
        state.vm.stop(task_id).await
    } else {
        state.vps.stop(task_id, q.snapshot).await
    };
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Deserialize, Default)]
struct RestartQuery {
    #[serde(default)]
    from_snapshot: bool,
}

async fn vps_restart(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<RestartQuery>,
) -> Response {
    // QEMU VPS instances live under the instance dir; Docker ones under the
    // docker daemon. Try the VM path first (it is cheap to check).
    let vm_result = state.vm.restart(task_id).await;
    let result = match vm_result {
        Ok(resp) => Ok(resp),
        Err(_) => state.vps.restart(task_id, q.from_snapshot).await,
    };
    match result {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn vps_pause(State(state): State<Arc<RunnerState>>, Path(task_id): Path<i64>) -> Response {
    match state.vps.pause(task_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

async fn vps_resume(State(state): State<Arc<RunnerState>>, Path(task_id): Path<i64>) -> Response {
    match state.vps.resume(task_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

// ---- snapshots ----

async fn snapshots_list(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
) -> Response {
    match state.vps.list_snapshots(task_id).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn snapshots_create(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Json(req): Json<SnapshotCreateRequest>,
) -> Response {
    match state.vps.snapshot(task_id, req.message).await {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Deserialize)]
struct SnapshotDeleteQuery {
    tag: String,
}

async fn snapshots_delete(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<SnapshotDeleteQuery>,
) -> Response {
    match state.vps.delete_snapshot(task_id, &q.tag).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ---- VM agent ----

async fn vm_phone_home(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    body: Bytes,
) -> Response {
    // cloud-init's phone_home module posts form data; the agent posts JSON.
    // Either way the body is informational only.
    let info = serde_json::from_slice::<VmPhoneHome>(&body).ok();
    debug!(task = task_id, info = ?info, "VM phone-home");
    if state.vm.phone_home(task_id).await {
        StatusCode::OK.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("unknown vm {task_id}"))
    }
}

async fn vm_heartbeat(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Json(beat): Json<VmHeartbeat>,
) -> Response {
    if state.vm.vm_heartbeat(task_id, beat).await {
        StatusCode::OK.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("unknown vm {task_id}"))
    }
}

async fn vm_images(State(state): State<Arc<RunnerState>>) -> Response {
    let mut images = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(&state.config.vm_images_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".qcow2") || name.ends_with(".img") {
                images.push(name);
            }
        }
    }
    images.sort();
    Json(images).into_response()
}

// ---- filesystem ----

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

/// Resolve the rootfs of whichever container a task runs as.
async fn task_rootfs(state: &RunnerState, task_id: i64) -> Result<std::path::PathBuf, Response> {
    let vps_name = super::vps::vps_container_name(task_id);
    if let Ok(root) = fsops::merged_rootfs(&vps_name).await {
        return Ok(root);
    }
    let task_name = super::executor::command_container_name(task_id);
    fsops::merged_rootfs(&task_name)
        .await
        .map_err(|e| error_response(StatusCode::NOT_FOUND, e))
}

fn resolve_or_400(
    root: &std::path::Path,
    requested: &str,
) -> Result<std::path::PathBuf, Response> {
    fsops::resolve_task_path(root, requested)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e))
}

async fn fs_list(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<PathQuery>,
) -> Response {
    let root = match task_rootfs(&state, task_id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let path = match resolve_or_400(&root, &q.path) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match fsops::list_dir(&path).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

async fn fs_read(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<PathQuery>,
) -> Response {
    let root = match task_rootfs(&state, task_id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let path = match resolve_or_400(&root, &q.path) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match fsops::read_file(&path).await {
        Ok(contents) => (
            [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
            contents,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn fs_write(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<PathQuery>,
    body: Bytes,
) -> Response {
    let root = match task_rootfs(&state, task_id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let path = match resolve_or_400(&root, &q.path) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match fsops::write_file(&path, &body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn fs_mkdir(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<PathQuery>,
) -> Response {
    let root = match task_rootfs(&state, task_id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let path = match resolve_or_400(&root, &q.path) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match fsops::make_dir(&path).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

#[derive(Deserialize)]
struct RenameBody {
    from: String,
    to: String,
}

async fn fs_rename(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Json(body): Json<RenameBody>,
) -> Response {
    let root = match task_rootfs(&state, task_id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let (from, to) = match (
        resolve_or_400(&root, &body.from),
        resolve_or_400(&root, &body.to),
    ) {
        (Ok(f), Ok(t)) => (f, t),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match fsops::rename(&from, &to).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn fs_delete(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<PathQuery>,
) -> Response {
    let root = match task_rootfs(&state, task_id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let path = match resolve_or_400(&root, &q.path) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match fsops::delete(&path).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

async fn fs_stat(
    State(state): State<Arc<RunnerState>>,
    Path(task_id): Path<i64>,
    Query(q): Query<PathQuery>,
) -> Response {
    let root = match task_rootfs(&state, task_id).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let path = match resolve_or_400(&root, &q.path) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match fsops::stat(&path).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

// ---- WebSockets ----

/// Tunnel attach point for in-container clients.
async fn ws_tunnel(
    State(state): State<Arc<RunnerState>>,
    Path(container_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.tunnels.attach(container_id, socket).await;
    })
}

#[derive(Deserialize, Default)]
struct ForwardQuery {
    #[serde(default)]
    proto: Option<String>,
}

/// Transparent per-connection forward: one WebSocket, one TCP/UDP stream to
/// `container_id:port`. For `vm-` targets the tunnel is bypassed and the
/// runner dials the guest address directly.
async fn ws_forward(
    State(state): State<Arc<RunnerState>>,
    Path((container_id, port)): Path<(String, u16)>,
    Query(q): Query<ForwardQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let proto = match q.proto.as_deref().unwrap_or("tcp") {
        "udp" => TunnelProto::Udp,
        _ => TunnelProto::Tcp,
    };
    ws.on_upgrade(move |socket| async move {
        if let Some(task_id) = container_id
            .strip_prefix("vm-")
            .and_then(|s| s.parse::<i64>().ok())
        {
            match state.vm.vm_ip_of(task_id).await {
                Some(ip) => forward_direct(socket, ip, port, proto).await,
                None => warn!(container = %vm_container_id(task_id), "Forward to unknown VM"),
            }
            return;
        }
        forward_via_tunnel(state, socket, container_id, port, proto).await;
    })
}

async fn forward_via_tunnel(
    state: Arc<RunnerState>,
    socket: WebSocket,
    container_id: String,
    port: u16,
    proto: TunnelProto,
) {
    let mut conn = match state.tunnels.open(&container_id, proto, port).await {
        Ok(c) => c,
        Err(e) => {
            warn!(container = %container_id, port, error = %e, "Tunnel forward failed");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if conn.send(&data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            data = conn.rx.recv() => match data {
                Some(chunk) => {
                    if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// VM bypass: dial the guest directly and pump bytes.
async fn forward_direct(socket: WebSocket, ip: Ipv4Addr, port: u16, proto: TunnelProto) {
    match proto {
        TunnelProto::Tcp => {
            let stream = match tokio::net::TcpStream::connect((ip, port)).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(vm = %ip, port, error = %e, "Direct VM connect failed");
                    return;
                }
            };
            let (mut ws_tx, mut ws_rx) = socket.split();
            let (mut tcp_rx, mut tcp_tx) = stream.into_split();

            let upstream = async {
                while let Some(msg) = ws_rx.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if tcp_tx.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                let _ = tcp_tx.shutdown().await;
            };
            let downstream = async {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match tcp_rx.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if ws_tx
                                .send(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
            };
            tokio::join!(upstream, downstream);
        }
        TunnelProto::Udp => {
            let sock = match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
                Ok(s) => s,
                Err(_) => return,
            };
            if sock.connect((ip, port)).await.is_err() {
                return;
            }
            let sock = Arc::new(sock);
            let (mut ws_tx, mut ws_rx) = socket.split();

            let send_sock = sock.clone();
            let upstream = async move {
                while let Some(Ok(Message::Binary(data))) = ws_rx.next().await {
                    if send_sock.send(&data).await.is_err() {
                        break;
                    }
                }
            };
            let downstream = async move {
                let mut buf = vec![0u8; 64 * 1024];
                while let Ok(n) = sock.recv(&mut buf).await {
                    if ws_tx
                        .send(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            };
            tokio::join!(upstream, downstream);
        }
    }
}
