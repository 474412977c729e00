use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::frame::{build_message, parse_message, FrameType, TunnelProto, KEEPALIVE_CLIENT_ID};

/// Socket read buffer. 64 KiB keeps bulk transfers in few frames without
/// hogging memory per connection.
const READ_BUFFER: usize = 64 * 1024;

/// Per-connection inbound buffer (WS -> socket direction).
const CONN_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    /// ws://runner:8001/ws/tunnel/{container_id}
    pub url: String,
    pub reconnect_delay: Duration,
}

type ConnMap = Arc<Mutex<HashMap<(TunnelProto, u32), mpsc::Sender<Bytes>>>>;

/// Run the in-container tunnel client forever: connect, serve, reconnect.
/// The attempt counter resets on every successful connection.
pub async fn run(config: TunnelClientConfig) {
    let mut attempt: u32 = 0;
    loop {
        match connect_async(&config.url).await {
            Ok((ws, _)) => {
                info!(url = %config.url, "Tunnel connected");
                attempt = 0;
                serve_session(ws).await;
                warn!("Tunnel disconnected, all connections torn down");
            }
            Err(e) => {
                attempt += 1;
                warn!(url = %config.url, attempt, error = %e, "Tunnel connect failed");
            }
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn serve_session(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CONN_BUFFER);
    let conns: ConnMap = Arc::new(Mutex::new(HashMap::new()));

    // Single writer task owns the WS sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let (header, payload) = match parse_message(&data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame from runner");
                continue;
            }
        };

        match header.frame_type {
            FrameType::Connect => {
                let (conn_tx, conn_rx) = mpsc::channel(CONN_BUFFER);
                conns
                    .lock()
                    .await
                    .insert((header.proto, header.client_id), conn_tx);
                let out = out_tx.clone();
                let conns = conns.clone();
                let (proto, cid, port) = (header.proto, header.client_id, header.port);
                tokio::spawn(async move {
                    match proto {
                        TunnelProto::Tcp => service_tcp(cid, port, out, conn_rx).await,
                        TunnelProto::Udp => service_udp(cid, port, out, conn_rx).await,
                    }
                    conns.lock().await.remove(&(proto, cid));
                });
            }
            FrameType::Data => {
                let conns = conns.lock().await;
                if let Some(tx) = conns.get(&(header.proto, header.client_id)) {
                    let _ = tx.send(Bytes::copy_from_slice(payload)).await;
                }
            }
            FrameType::Close => {
                // Dropping the sender ends the connection's writer loop.
                conns
                    .lock()
                    .await
                    .remove(&(header.proto, header.client_id));
            }
            FrameType::Ping => {
                let pong =
                    build_message(FrameType::Pong, header.proto, KEEPALIVE_CLIENT_ID, 0, &[]);
                let _ = out_tx.send(pong).await;
            }
            FrameType::Connected | FrameType::Error | FrameType::Pong => {
                debug!(frame = ?header.frame_type, "Ignoring unexpected frame direction");
            }
        }
    }

    // Teardown: every active connection dies with the session.
    conns.lock().await.clear();
    writer.abort();
}

/// Serve one TCP connection: dial 127.0.0.1:port, confirm or reject, then
/// pump bytes both ways until either side closes.
async fn service_tcp(
    client_id: u32,
    port: u16,
    out: mpsc::Sender<Bytes>,
    mut inbound: mpsc::Receiver<Bytes>,
) {
    let sock = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(s) => s,
        Err(e) => {
            let _ = out
                .send(build_message(
                    FrameType::Error,
                    TunnelProto::Tcp,
                    client_id,
                    port,
                    e.to_string().as_bytes(),
                ))
                .await;
            return;
        }
    };
    let _ = out
        .send(build_message(
            FrameType::Connected,
            TunnelProto::Tcp,
            client_id,
            port,
            &[],
        ))
        .await;

    let (mut read_half, mut write_half) = sock.into_split();

    // Socket -> WS
    let reader_out = out.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = build_message(
                        FrameType::Data,
                        TunnelProto::Tcp,
                        client_id,
                        port,
                        &buf[..n],
                    );
                    if reader_out.send(frame).await.is_err() {
                        return; // session gone, no CLOSE needed
                    }
                }
            }
        }
        let _ = reader_out
            .send(build_message(
                FrameType::Close,
                TunnelProto::Tcp,
                client_id,
                port,
                &[],
            ))
            .await;
    });

    // WS -> socket
    while let Some(data) = inbound.recv().await {
        if write_half.write_all(&data).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
    let _ = reader.await;
}

/// Serve one UDP "connection": a local socket bound to an ephemeral port,
/// connected to 127.0.0.1:port. Datagram boundaries map 1:1 to DATA frames.
async fn service_udp(
    client_id: u32,
    port: u16,
    out: mpsc::Sender<Bytes>,
    mut inbound: mpsc::Receiver<Bytes>,
) {
    let sock = match UdpSocket::bind("127.0.0.1:0").await {
        Ok(s) => s,
        Err(e) => {
            let _ = out
                .send(build_message(
                    FrameType::Error,
                    TunnelProto::Udp,
                    client_id,
                    port,
                    e.to_string().as_bytes(),
                ))
                .await;
            return;
        }
    };
    if let Err(e) = sock.connect(("127.0.0.1", port)).await {
        let _ = out
            .send(build_message(
                FrameType::Error,
                TunnelProto::Udp,
                client_id,
                port,
                e.to_string().as_bytes(),
            ))
            .await;
        return;
    }
    let _ = out
        .send(build_message(
            FrameType::Connected,
            TunnelProto::Udp,
            client_id,
            port,
            &[],
        ))
        .await;

    let sock = Arc::new(sock);
    let recv_sock = sock.clone();
    let reader_out = out.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match recv_sock.recv(&mut buf).await {
                Ok(n) => {
                    let frame = build_message(
                        FrameType::Data,
                        TunnelProto::Udp,
                        client_id,
                        port,
                        &buf[..n],
                    );
                    if reader_out.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    while let Some(data) = inbound.recv().await {
        if sock.send(&data).await.is_err() {
            break;
        }
    }
    reader.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::frame::parse_message;
    use tokio::net::TcpListener;

    async fn next_frame(rx: &mut mpsc::Receiver<Bytes>) -> (FrameType, u32, Vec<u8>) {
        let frame = rx.recv().await.expect("frame");
        let (header, payload) = parse_message(&frame).unwrap();
        (header.frame_type, header.client_id, payload.to_vec())
    }

    #[tokio::test]
    async fn tcp_connect_to_closed_port_reports_error() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (_in_tx, in_rx) = mpsc::channel(16);

        // Bind-then-drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        service_tcp(5, port, out_tx, in_rx).await;

        let (frame_type, client_id, payload) = next_frame(&mut out_rx).await;
        assert_eq!(frame_type, FrameType::Error);
        assert_eq!(client_id, 5);
        assert!(!payload.is_empty());
    }

    #[tokio::test]
    async fn tcp_echo_round_trip() {
        // Local echo server.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let conn = tokio::spawn(service_tcp(1, port, out_tx, in_rx));

        let (frame_type, _, _) = next_frame(&mut out_rx).await;
        assert_eq!(frame_type, FrameType::Connected);

        in_tx.send(Bytes::from_static(b"ping")).await.unwrap();
        let (frame_type, client_id, payload) = next_frame(&mut out_rx).await;
        assert_eq!(frame_type, FrameType::Data);
        assert_eq!(client_id, 1);
        assert_eq!(payload, b"ping");

        // Dropping the inbound sender closes the connection; the reader
        // observes EOF and emits CLOSE.
        drop(in_tx);
        let (frame_type, _, _) = next_frame(&mut out_rx).await;
        assert_eq!(frame_type, FrameType::Close);
        conn.await.unwrap();
    }

    #[tokio::test]
    async fn udp_round_trip() {
        // Local UDP echo server.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, from)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&buf[..n], from).await;
            }
        });

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        tokio::spawn(service_udp(2, port, out_tx, in_rx));

        let (frame_type, _, _) = next_frame(&mut out_rx).await;
        assert_eq!(frame_type, FrameType::Connected);

        in_tx.send(Bytes::from_static(b"query")).await.unwrap();
        let (frame_type, client_id, payload) = next_frame(&mut out_rx).await;
        assert_eq!(frame_type, FrameType::Data);
        assert_eq!(client_id, 2);
        assert_eq!(payload, b"query");
    }
}
