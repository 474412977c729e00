use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::frame::{
    build_message, parse_message, FrameType, TunnelProto, KEEPALIVE_CLIENT_ID,
};

/// Outbound frame buffer per container WS.
const FRAME_BUFFER: usize = 256;

/// Inbound data buffer per multiplexed connection.
const CONN_BUFFER: usize = 256;

/// Consecutive unanswered pings before the WS is declared dead.
const MAX_MISSED_PONGS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("no tunnel attached for container {0}")]
    NotAttached(String),
    #[error("tunnel client rejected the connection: {0}")]
    ConnectRefused(String),
    #[error("tunnel connection timed out")]
    Timeout,
    #[error("tunnel channel closed")]
    Closed,
}

/// State for one container's attached tunnel WebSocket.
#[derive(Debug)]
pub struct ContainerTunnel {
    container_id: String,
    frames_tx: mpsc::Sender<Bytes>,
    next_client_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<(), String>>>>,
    conns: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    missed_pongs: AtomicU32,
}

impl ContainerTunnel {
    fn new(container_id: String, frames_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            container_id,
            frames_tx,
            // 0 is the keepalive id; real connections start at 1.
            next_client_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            missed_pongs: AtomicU32::new(0),
        }
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TunnelError> {
        self.frames_tx
            .send(frame)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Route one frame received from the in-container client.
    pub async fn handle_frame(&self, data: &[u8]) {
        let (header, payload) = match parse_message(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(container = %self.container_id, error = %e, "Dropping malformed tunnel frame");
                return;
            }
        };

        match header.frame_type {
            FrameType::Connected => {
                if let Some(waiter) = self.pending.lock().await.remove(&header.client_id) {
                    let _ = waiter.send(Ok(()));
                }
            }
            FrameType::Error => {
                let message = String::from_utf8_lossy(payload).into_owned();
                if let Some(waiter) = self.pending.lock().await.remove(&header.client_id) {
                    let _ = waiter.send(Err(message));
                } else {
                    warn!(
                        container = %self.container_id,
                        client = header.client_id,
                        error = %message,
                        "Tunnel error for unknown connection"
                    );
                }
            }
            FrameType::Data => {
                let conns = self.conns.lock().await;
                if let Some(tx) = conns.get(&header.client_id) {
                    if tx.send(Bytes::copy_from_slice(payload)).await.is_err() {
                        debug!(client = header.client_id, "Receiver gone, data dropped");
                    }
                }
            }
            FrameType::Close => {
                self.conns.lock().await.remove(&header.client_id);
                self.pending.lock().await.remove(&header.client_id);
            }
            FrameType::Pong => {
                self.missed_pongs.store(0, Ordering::SeqCst);
            }
            FrameType::Ping => {
                let _ = self
                    .send_frame(build_message(
                        FrameType::Pong,
                        header.proto,
                        KEEPALIVE_CLIENT_ID,
                        0,
                        &[],
                    ))
                    .await;
            }
            FrameType::Connect => {
                // CONNECT only ever flows runner -> client.
                warn!(container = %self.container_id, "Unexpected CONNECT from tunnel client");
            }
        }
    }

    async fn teardown(&self) {
        self.conns.lock().await.clear();
        let mut pending = self.pending.lock().await;
        for (_, waiter) in pending.drain() {
            let _ = waiter.send(Err("tunnel disconnected".into()));
        }
    }
}

/// One multiplexed connection through a container tunnel. Dropping it sends
/// CLOSE to the in-container client.
#[derive(Debug)]
pub struct TunnelConn {
    tunnel: Arc<ContainerTunnel>,
    pub client_id: u32,
    pub proto: TunnelProto,
    pub port: u16,
    pub rx: mpsc::Receiver<Bytes>,
}

impl TunnelConn {
    pub async fn send(&self, payload: &[u8]) -> Result<(), TunnelError> {
        self.tunnel
            .send_frame(build_message(
                FrameType::Data,
                self.proto,
                self.client_id,
                self.port,
                payload,
            ))
            .await
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        let tunnel = self.tunnel.clone();
        let frame = build_message(FrameType::Close, self.proto, self.client_id, self.port, &[]);
        let client_id = self.client_id;
        tokio::spawn(async move {
            tunnel.conns.lock().await.remove(&client_id);
            let _ = tunnel.send_frame(frame).await;
        });
    }
}

/// Runner-side tunnel hub: one WebSocket per container, many multiplexed
/// connections per WebSocket.
pub struct TunnelServer {
    containers: RwLock<HashMap<String, Arc<ContainerTunnel>>>,
    ping_interval: Duration,
}

impl TunnelServer {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            ping_interval,
        }
    }

    pub async fn is_attached(&self, container_id: &str) -> bool {
        self.containers.read().await.contains_key(container_id)
    }

    /// Serve an attached container WebSocket until it disconnects. A new
    /// attach for the same container replaces the old registration.
    pub async fn attach(&self, container_id: String, socket: WebSocket) {
        let (frames_tx, mut frames_rx) = mpsc::channel::<Bytes>(FRAME_BUFFER);
        let tunnel = Arc::new(ContainerTunnel::new(container_id.clone(), frames_tx));

        if self
            .containers
            .write()
            .await
            .insert(container_id.clone(), tunnel.clone())
            .is_some()
        {
            warn!(container = %container_id, "Replacing existing tunnel attachment");
        }
        info!(container = %container_id, "Tunnel client attached");

        let (mut ws_tx, mut ws_rx) = socket.split();

        // Single writer: everything outbound funnels through frames_rx.
        let writer = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if ws_tx.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        });

        // Keepalive: PING every interval, give up after two silent ones and
        // signal the reader to shut the session down.
        let (dead_tx, mut dead_rx) = oneshot::channel::<()>();
        let pinger_tunnel = tunnel.clone();
        let ping_interval = self.ping_interval;
        let pinger = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await; // first tick is immediate — skip it
            loop {
                interval.tick().await;
                let missed = pinger_tunnel.missed_pongs.fetch_add(1, Ordering::SeqCst);
                if missed >= MAX_MISSED_PONGS {
                    warn!(container = %pinger_tunnel.container_id, "Tunnel missed pongs, closing");
                    break;
                }
                let ping = build_message(
                    FrameType::Ping,
                    TunnelProto::Tcp,
                    KEEPALIVE_CLIENT_ID,
                    0,
                    &[],
                );
                if pinger_tunnel.send_frame(ping).await.is_err() {
                    break;
                }
            }
            let _ = dead_tx.send(());
        });

        // Reader: route frames until the socket closes or the pinger gives up.
        loop {
            tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Binary(data))) => tunnel.handle_frame(&data).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // text/ping/pong at the WS layer: ignored
                    Some(Err(e)) => {
                        debug!(container = %container_id, error = %e, "Tunnel WS read error");
                        break;
                    }
                },
                _ = &mut dead_rx => break,
            }
        }

        pinger.abort();
        writer.abort();
        tunnel.teardown().await;

        // Only remove if this attachment still owns the slot.
        let mut containers = self.containers.write().await;
        if let Some(current) = containers.get(&container_id) {
            if Arc::ptr_eq(current, &tunnel) {
                containers.remove(&container_id);
            }
        }
        info!(container = %container_id, "Tunnel client detached");
    }

    /// Open a multiplexed connection to `127.0.0.1:port` inside a container,
    /// waiting for the client's CONNECTED/ERROR response.
    pub async fn open(
        &self,
        container_id: &str,
        proto: TunnelProto,
        port: u16,
    ) -> Result<TunnelConn, TunnelError> {
        let tunnel = self
            .containers
            .read()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| TunnelError::NotAttached(container_id.to_string()))?;

        let client_id = tunnel.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel(CONN_BUFFER);

        tunnel.pending.lock().await.insert(client_id, confirm_tx);
        tunnel.conns.lock().await.insert(client_id, data_tx);

        tunnel
            .send_frame(build_message(FrameType::Connect, proto, client_id, port, &[]))
            .await?;

        let confirmed = tokio::time::timeout(Duration::from_secs(10), confirm_rx).await;
        match confirmed {
            Ok(Ok(Ok(()))) => Ok(TunnelConn {
                tunnel,
                client_id,
                proto,
                port,
                rx: data_rx,
            }),
            Ok(Ok(Err(message))) => {
                tunnel.conns.lock().await.remove(&client_id);
                Err(TunnelError::ConnectRefused(message))
            }
            Ok(Err(_)) => {
                tunnel.conns.lock().await.remove(&client_id);
                Err(TunnelError::Closed)
            }
            Err(_) => {
                tunnel.pending.lock().await.remove(&client_id);
                tunnel.conns.lock().await.remove(&client_id);
                Err(TunnelError::Timeout)
            }
        }
    }
}
