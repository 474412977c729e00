use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// How many ports above the base the proxy will probe before giving up.
const PORT_SCAN_WINDOW: u16 = 512;

struct SshEntry {
    host_port: u16,
    listener: JoinHandle<()>,
}

/// Host-side SSH proxy: one TCP listener per SSH-enabled VPS, relaying each
/// accepted stream through the runner's per-port WebSocket forward endpoint
/// (which reaches the workload via the container tunnel or, for VMs, a
/// direct connection).
pub struct SshProxy {
    base_port: u16,
    entries: Mutex<HashMap<i64, SshEntry>>,
}

impl SshProxy {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or look up) the host-side listener for a VPS. Returns the
    /// bound port. Idempotent per task.
    pub async fn expose(
        &self,
        task_id: i64,
        runner_url: &str,
        container_id: &str,
        container_port: u16,
    ) -> Result<u16> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&task_id) {
            return Ok(entry.host_port);
        }

        let ws_url = ws_forward_url(runner_url, container_id, container_port);
        let (listener, host_port) = self.bind_free_port(&entries).await?;
        info!(task = task_id, port = host_port, target = %ws_url, "SSH proxy listening");

        let accept_url = ws_url.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "SSH proxy connection");
                        let url = accept_url.clone();
                        tokio::spawn(async move {
                            if let Err(e) = relay_tcp_over_ws(stream, &url).await {
                                debug!(error = %e, "SSH relay ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "SSH proxy accept failed");
                        break;
                    }
                }
            }
        });

        entries.insert(
            task_id,
            SshEntry {
                host_port,
                listener: handle,
            },
        );
        Ok(host_port)
    }

    async fn bind_free_port(
        &self,
        entries: &HashMap<i64, SshEntry>,
    ) -> Result<(TcpListener, u16)> {
        let used: std::collections::HashSet<u16> =
            entries.values().map(|e| e.host_port).collect();
        for offset in 0..PORT_SCAN_WINDOW {
            let port = self.base_port.saturating_add(offset);
            if used.contains(&port) {
                continue;
            }
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                return Ok((listener, port));
            }
        }
        bail!(
            "no free SSH proxy port in {}..{}",
            self.base_port,
            self.base_port.saturating_add(PORT_SCAN_WINDOW)
        )
    }

    /// Stop proxying for a task. Idempotent.
    pub async fn release(&self, task_id: i64) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(&task_id) {
            entry.listener.abort();
            info!(task = task_id, port = entry.host_port, "SSH proxy released");
        }
    }

    pub async fn lookup(&self, task_id: i64) -> Option<u16> {
        self.entries.lock().await.get(&task_id).map(|e| e.host_port)
    }
}

/// Derive the runner's transparent forward endpoint from its HTTP base URL.
pub fn ws_forward_url(runner_url: &str, container_id: &str, port: u16) -> String {
    let base = runner_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };
    format!("{ws_base}/ws/forward/{container_id}/{port}?proto=tcp")
}

/// Pump a TCP stream through a WebSocket carrying raw binary chunks.
async fn relay_tcp_over_ws(stream: TcpStream, ws_url: &str) -> Result<()> {
    let (ws, _) = connect_async(ws_url)
        .await
        .with_context(|| format!("connect {ws_url}"))?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut tcp_rx, mut tcp_tx) = stream.into_split();

    let upstream = async {
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

    let downstream = async {
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

    tokio::join!(upstream, downstream);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_from_http_base() {
        assert_eq!(
            ws_forward_url("http://node1:8001", "kohakuriver-vps-7", 9000),
            "ws://node1:8001/ws/forward/kohakuriver-vps-7/9000?proto=tcp"
        );
    }

    #[test]
    fn ws_url_from_https_base_and_trailing_slash() {
        assert_eq!(
            ws_forward_url("https://node1:8001/", "vm-9", 22),
            "wss://node1:8001/ws/forward/vm-9/22?proto=tcp"
        );
    }

    #[tokio::test]
    async fn expose_allocates_distinct_ports_and_is_idempotent() {
        let proxy = SshProxy::new(39000);
        let a = proxy
            .expose(1, "http://node1:8001", "kohakuriver-vps-1", 9000)
            .await
            .unwrap();
        let b = proxy
            .expose(2, "http://node1:8001", "kohakuriver-vps-2", 9001)
            .await
            .unwrap();
        assert_ne!(a, b);

        let again = proxy
            .expose(1, "http://node1:8001", "kohakuriver-vps-1", 9000)
            .await
            .unwrap();
        assert_eq!(a, again);

        assert_eq!(proxy.lookup(1).await, Some(a));
        proxy.release(1).await;
        proxy.release(1).await; // idempotent
        assert_eq!(proxy.lookup(1).await, None);
    }

    #[tokio::test]
    async fn released_port_can_be_reused() {
        let proxy = SshProxy::new(39100);
        let a = proxy
            .expose(1, "http://node1:8001", "kohakuriver-vps-1", 9000)
            .await
            .unwrap();
        proxy.release(1).await;
        // Give the aborted listener a beat to drop its socket.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let b = proxy
            .expose(3, "http://node1:8001", "kohakuriver-vps-3", 9002)
            .await
            .unwrap();
        assert_eq!(a, b);
    }
}
