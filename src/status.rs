//! Embedded HTTP status endpoint: reports per-device and per-TSDB-profile
//! counters. Deliberately small — the orchestrator's own control flow
//! already depends on whether `http_port == 0`, so this exists mainly to
//! give that branch something real to start.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Serialize;

use crate::device::DeviceCounters;
use crate::tsdb::TsdbHandle;

/// Per-device handles onto the debug-toggle and enabled-query channels
/// `Device::run` selects over, so the status endpoint can drive them.
#[derive(Clone)]
pub struct DeviceControl {
    pub debug: tokio::sync::mpsc::Sender<crate::device::DebugToggle>,
    pub enabled: tokio::sync::mpsc::Sender<tokio::sync::oneshot::Sender<bool>>,
}

#[derive(Clone)]
pub struct StatusState {
    pub devices: Arc<HashMap<String, Arc<DeviceCounters>>>,
    pub controls: Arc<HashMap<String, DeviceControl>>,
    pub tsdb_profiles: Arc<HashMap<String, TsdbHandle>>,
}

#[derive(Serialize)]
struct DeviceStatus {
    requests: u64,
    gets: u64,
    errors: u64,
}

#[derive(Serialize)]
struct TsdbStatus {
    sent: u64,
    errors: u64,
}

#[derive(Serialize)]
struct StatusResponse {
    devices: HashMap<String, DeviceStatus>,
    tsdb: HashMap<String, TsdbStatus>,
}

async fn status_handler(State(state): State<StatusState>) -> Json<StatusResponse> {
    let devices = state
        .devices
        .iter()
        .map(|(id, counters)| {
            (
                id.clone(),
                DeviceStatus {
                    requests: counters.requests.load(Ordering::Relaxed),
                    gets: counters.gets.load(Ordering::Relaxed),
                    errors: counters.errors.load(Ordering::Relaxed),
                },
            )
        })
        .collect();

    let tsdb = state
        .tsdb_profiles
        .iter()
        .map(|(id, handle)| {
            (
                id.clone(),
                TsdbStatus {
                    sent: handle.sent(),
                    errors: handle.errors(),
                },
            )
        })
        .collect();

    Json(StatusResponse { devices, tsdb })
}

async fn debug_toggle_handler(
    State(state): State<StatusState>,
    Path((device_id, enable)): Path<(String, bool)>,
) -> StatusCode {
    let Some(control) = state.controls.get(&device_id) else {
        return StatusCode::NOT_FOUND;
    };
    let toggle = if enable {
        crate::device::DebugToggle::Enable
    } else {
        crate::device::DebugToggle::Disable
    };
    match control.debug.send(toggle).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn debug_enabled_handler(
    State(state): State<StatusState>,
    Path(device_id): Path<String>,
) -> Result<Json<bool>, StatusCode> {
    let control = state.controls.get(&device_id).ok_or(StatusCode::NOT_FOUND)?;
    let (respond_tx, respond_rx) = tokio::sync::oneshot::channel();
    control
        .enabled
        .send(respond_tx)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let enabled = respond_rx.await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(enabled))
}

pub async fn serve(port: u16, state: StatusState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/devices/:device_id/debug/:enable", post(debug_toggle_handler))
        .route("/devices/:device_id/debug", get(debug_enabled_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("status: listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
