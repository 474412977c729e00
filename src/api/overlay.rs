use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::error::error_response;
use super::HostState;
use crate::overlay::reservation::ReservationError;

pub fn routes() -> Router<Arc<HostState>> {
    Router::new()
        .route("/api/overlay/status", get(status))
        .route("/api/overlay/ip/reserve", post(reserve))
        .route("/api/overlay/ip/release", post(release))
        .route("/api/overlay/ip/available", get(available))
        .route("/api/overlay/ip/validate", post(validate))
}

#[derive(Serialize)]
struct OverlayStatus {
    subnet: String,
    allocations: Vec<crate::overlay::OverlayAllocation>,
    reservations: Vec<crate::overlay::reservation::Reservation>,
}

async fn status(State(state): State<Arc<HostState>>) -> Response {
    Json(OverlayStatus {
        subnet: state.scheduler.overlay.subnet.root_cidr(),
        allocations: state.scheduler.overlay.status().await,
        reservations: state.scheduler.reservations.list(None).await,
    })
    .into_response()
}

#[derive(Deserialize)]
struct ReserveBody {
    runner: String,
    #[serde(default)]
    ip: Option<Ipv4Addr>,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

fn reservation_error(e: ReservationError) -> Response {
    let status = match e {
        ReservationError::PoolExhausted => StatusCode::CONFLICT,
        ReservationError::IpUnavailable(_) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(status, e)
}

/// Reserve an overlay address ahead of submission (distributed-training
/// masters grab their address here, then submit with the token).
async fn reserve(
    State(state): State<Arc<HostState>>,
    Json(body): Json<ReserveBody>,
) -> Response {
    let Some(range) = state.scheduler.overlay.ip_range_for(&body.runner).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("runner {} has no overlay allocation", body.runner),
        );
    };
    let ttl = body
        .ttl_secs
        .unwrap_or(state.scheduler.config().reservation_ttl_secs);
    match state
        .scheduler
        .reservations
        .reserve(&body.runner, range, body.ip, ttl)
        .await
    {
        Ok(reservation) => (StatusCode::CREATED, Json(reservation)).into_response(),
        Err(e) => reservation_error(e),
    }
}

#[derive(Deserialize, Default)]
struct ReleaseBody {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    container_id: Option<String>,
    #[serde(default)]
    runner: Option<String>,
    #[serde(default)]
    ip: Option<Ipv4Addr>,
}

/// Release a reservation by token, by container, or by direct (runner, ip)
/// pair. All three forms are idempotent.
async fn release(
    State(state): State<Arc<HostState>>,
    Json(body): Json<ReleaseBody>,
) -> Response {
    let reservations = &state.scheduler.reservations;
    if let Some(token) = &body.token {
        reservations.release_by_token(token).await;
        return StatusCode::OK.into_response();
    }
    if let Some(container) = &body.container_id {
        reservations.release_by_container(container).await;
        return StatusCode::OK.into_response();
    }
    if let (Some(runner), Some(ip)) = (&body.runner, body.ip) {
        reservations.mark_ip_free(runner, ip).await;
        return StatusCode::OK.into_response();
    }
    error_response(
        StatusCode::BAD_REQUEST,
        "provide token, container_id, or runner+ip",
    )
}

#[derive(Deserialize)]
struct AvailableQuery {
    runner: String,
}

async fn available(
    State(state): State<Arc<HostState>>,
    Query(q): Query<AvailableQuery>,
) -> Response {
    let Some(range) = state.scheduler.overlay.ip_range_for(&q.runner).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("runner {} has no overlay allocation", q.runner),
        );
    };
    let ips = state.scheduler.reservations.available(&q.runner, range).await;
    Json(serde_json::json!({
        "runner": q.runner,
        "count": ips.len(),
        "available": ips,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct ValidateBody {
    token: String,
    #[serde(default)]
    runner: Option<String>,
}

async fn validate(
    State(state): State<Arc<HostState>>,
    Json(body): Json<ValidateBody>,
) -> Response {
    match state
        .scheduler
        .reservations
        .validate(&body.token, body.runner.as_deref())
        .await
    {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => reservation_error(e),
    }
}
