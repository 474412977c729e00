use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use kohakuriver::tunnel::client::{self, TunnelClientConfig};

/// In-container tunnel client. The runner injects KOHAKURIVER_TUNNEL_URL
/// (and KOHAKURIVER_CONTAINER_ID for logging) into every container it
/// launches; this binary is bind-mounted read-only.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kohakuriver=info".into()),
        )
        .init();

    let url = std::env::var("KOHAKURIVER_TUNNEL_URL")
        .context("KOHAKURIVER_TUNNEL_URL is not set")?;
    let container_id = std::env::var("KOHAKURIVER_CONTAINER_ID").unwrap_or_default();
    let reconnect_secs: u64 = std::env::var("KOHAKURIVER_TUNNEL_RECONNECT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    info!(url = %url, container = %container_id, "Tunnel client starting");
    client::run(TunnelClientConfig {
        url,
        reconnect_delay: Duration::from_secs(reconnect_secs),
    })
    .await;
    Ok(())
}
