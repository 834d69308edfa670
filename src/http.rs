//! Zone management endpoint.
//!
//! * `GET /all` lists every zone as JSON.
//! * `POST /add` merges one JSON zone definition into the store.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use tokio::net::TcpListener;

use crate::types::Zone;
use crate::zones::ZoneStore;

pub fn router(zones: Arc<ZoneStore>) -> Router {
    Router::new()
        .route("/all", get(list_zones))
        .route("/add", post(add_zone))
        .with_state(zones)
}

/// Serve the management API on `bind_addr`.
pub async fn run_http_server(bind_addr: SocketAddr, zones: Arc<ZoneStore>) -> anyhow::Result<()> {
    info!("Zone management API listening on {}", bind_addr);
    let listener = TcpListener::bind(bind_addr).await?;
    axum::serve(listener, router(zones)).await?;
    Ok(())
}

async fn list_zones(State(zones): State<Arc<ZoneStore>>) -> Json<Vec<Zone>> {
    Json(zones.list().await)
}

async fn add_zone(
    State(zones): State<Arc<ZoneStore>>,
    payload: Result<Json<Zone>, JsonRejection>,
) -> Result<StatusCode, (StatusCode, String)> {
    let Json(zone) = payload.map_err(|e| (StatusCode::BAD_REQUEST, e.body_text()))?;
    if zone.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "zone name must not be empty".into()));
    }

    info!("Merging zone {} ({} records)", zone.name, zone.records.len());
    zones.merge(zone).await;
    Ok(StatusCode::OK)
}
