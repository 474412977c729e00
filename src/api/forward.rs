use std::sync::Arc;

use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{debug, warn};

use super::error::error_response;
use super::HostState;
use crate::db::tasks as task_store;
use crate::scheduler::Scheduler;

pub fn routes() -> Router<Arc<HostState>> {
    Router::new().route("/ws/forward/{task_id}/{port}", get(forward))
}

#[derive(Deserialize, Default)]
struct ForwardQuery {
    #[serde(default)]
    proto: Option<String>,
}

/// Protocol-transparent WS proxy: the external client's WebSocket is
/// spliced onto the runner's per-port forward endpoint. Frames pass through
/// unparsed — the Host never looks inside.
async fn forward(
    State(state): State<Arc<HostState>>,
    Path((task_id, port)): Path<(i64, u16)>,
    Query(q): Query<ForwardQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let task = match task_store::get(&state.scheduler.db.pool, task_id).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, format!("task {task_id} not found"))
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let Some(node) = task.assigned_node.clone() else {
        return error_response(StatusCode::CONFLICT, "task has no assigned node");
    };
    let Some(runner_url) = state.scheduler.registry.url_of(&node).await else {
        return error_response(StatusCode::BAD_GATEWAY, format!("node {node} offline"));
    };

    let container_id = Scheduler::container_id_for(&task);
    let proto = match q.proto.as_deref().unwrap_or("tcp") {
        "udp" => "udp",
        _ => "tcp",
    };
    let runner_ws = format!(
        "{}/ws/forward/{container_id}/{port}?proto={proto}",
        http_to_ws(&runner_url)
    );

    ws.on_upgrade(move |socket| async move {
        relay(socket, &runner_ws).await;
    })
}

fn http_to_ws(url: &str) -> String {
    let base = url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    }
}

async fn relay(client: WebSocket, runner_ws_url: &str) {
    let (runner, _) = match connect_async(runner_ws_url).await {
        Ok(c) => c,
        Err(e) => {
            warn!(url = %runner_ws_url, error = %e, "Runner WS connect failed");
            return;
        }
    };
    let (mut client_tx, mut client_rx) = client.split();
    let (mut runner_tx, mut runner_rx) = runner.split();

    let upstream = async {
        while let Some(msg) = client_rx.next().await {
            let forwarded = match msg {
                Ok(AxumMessage::Binary(data)) => TungsteniteMessage::Binary(data),
                Ok(AxumMessage::Text(text)) => {
                    TungsteniteMessage::Text(text.as_str().into())
                }
                Ok(AxumMessage::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if runner_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = runner_tx.send(TungsteniteMessage::Close(None)).await;
    };

    let downstream = async {
        while let Some(msg) = runner_rx.next().await {
            let forwarded = match msg {
                Ok(TungsteniteMessage::Binary(data)) => AxumMessage::Binary(data),
                Ok(TungsteniteMessage::Text(text)) => {
                    AxumMessage::Text(text.as_str().into())
                }
                Ok(TungsteniteMessage::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = client_tx.send(AxumMessage::Close(None)).await;
    };

    tokio::join!(upstream, downstream);
    debug!(url = %runner_ws_url, "Forward relay finished");
}
