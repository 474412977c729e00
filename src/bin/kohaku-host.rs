use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use kohakuriver::api::{self, HostState};
use kohakuriver::config::HostConfig;
use kohakuriver::db::Database;
use kohakuriver::overlay::reservation::IpReservationService;
use kohakuriver::overlay::OverlayManager;
use kohakuriver::scheduler::registry::NodeRegistry;
use kohakuriver::scheduler::Scheduler;
use kohakuriver::tunnel::ssh::SshProxy;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kohakuriver=info,tower_http=info".into()),
        )
        .init();

    info!("Starting KohakuRiver host v{}", env!("CARGO_PKG_VERSION"));

    let config = HostConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        subnet = %config.overlay_subnet.root_cidr(),
        "Configuration loaded"
    );

    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("Database initialized");

    // Overlay boot: forwarding, anchor interface, firewall, and the
    // recovery pass over surviving vxkr* interfaces.
    let overlay = Arc::new(OverlayManager::new(
        config.overlay_subnet,
        config.base_vxlan_id,
    ));
    if let Err(e) = overlay.init().await {
        warn!(error = %e, "Overlay initialization incomplete — continuing; runners may not get overlay networking");
    }

    let reservations = Arc::new(IpReservationService::new(config.reservation_secret.clone()));
    if config.reservation_secret.is_none() {
        info!("Reservation secret generated for this process; tokens will not survive a restart");
    }

    let registry = Arc::new(NodeRegistry::new());
    let ssh_proxy = Arc::new(SshProxy::new(config.ssh_proxy_port_base));

    let scheduler = Scheduler::new(
        db,
        registry,
        overlay,
        reservations,
        config.clone(),
    )
    .await?;

    // Re-apply allocations for tasks that were live before a restart.
    scheduler.recover_allocations().await?;

    // Dispatch loop + liveness/assignment scanners.
    scheduler.spawn_loops();

    let state = Arc::new(HostState {
        scheduler,
        ssh_proxy,
        http: reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?,
    });

    let app = api::router(state);
    let addr = config.listen_addr.parse::<std::net::SocketAddr>()?;
    info!("Starting host API on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
