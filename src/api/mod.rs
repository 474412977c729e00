pub mod error;
pub mod forward;
pub mod nodes;
pub mod overlay;
pub mod tasks;
pub mod vps;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::scheduler::Scheduler;
use crate::tunnel::ssh::SshProxy;

/// Shared Host state available to all handlers.
pub struct HostState {
    pub scheduler: Scheduler,
    pub ssh_proxy: Arc<SshProxy>,
    /// Client for proxied runner calls (snapshots, stop/restart).
    pub http: reqwest::Client,
}

pub fn router(state: Arc<HostState>) -> Router {
    Router::new()
        .merge(nodes::routes())
        .merge(tasks::routes())
        .merge(vps::routes())
        .merge(overlay::routes())
        .merge(forward::routes())
        .layer(TraceLayer::new_for_http())
        // Dashboard and CLI clients come from arbitrary origins; the API
        // itself carries no cookie-based auth.
        .layer(CorsLayer::permissive())
        .with_state(state)
}
