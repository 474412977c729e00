use anyhow::{Context, Result};
use tracing::{info, warn};

use kohakuriver::config::{detect_physical_ip, RunnerConfig};
use kohakuriver::runner::{api, heartbeat, RunnerState};

/// Pull host and port out of a base URL like "http://host:8000".
fn host_and_port(url: &str) -> (String, u16) {
    let trimmed = url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let authority = trimmed.split('/').next().unwrap_or(trimmed);
    match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(8000),
        ),
        None => (authority.to_string(), 8000),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kohakuriver=info,tower_http=info".into()),
        )
        .init();

    info!("Starting KohakuRiver runner v{}", env!("CARGO_PKG_VERSION"));

    let config = RunnerConfig::from_env()?;
    info!(
        hostname = %config.hostname,
        host_url = %config.host_url,
        listen_addr = %config.listen_addr,
        "Configuration loaded"
    );

    for dir in [
        config.local_temp_dir.clone(),
        config.log_dir(),
        config.container_dir(),
        config.vm_images_dir.clone(),
        config.vm_instances_dir.clone(),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
    }

    let (host, port) = host_and_port(&config.host_url);
    let physical_ip = detect_physical_ip(&host, port)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|e| {
            warn!(error = %e, "Could not detect physical IP, using hostname resolution on the host side");
            String::from("0.0.0.0")
        });
    info!(physical_ip = %physical_ip, "Detected physical address");

    let listen_addr = config.listen_addr.clone();
    let state = RunnerState::new(config, physical_ip)?;

    // Reclaim or release VM state left over from a previous process life.
    if let Err(e) = state.vm.cleanup().await {
        warn!(error = %e, "VM cleanup pass failed");
    }

    // Registration + heartbeat loop (also applies the overlay assignment).
    tokio::spawn(heartbeat::run(state.clone()));

    let app = api::router(state);
    let addr = listen_addr.parse::<std::net::SocketAddr>()?;
    info!("Starting runner API on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
