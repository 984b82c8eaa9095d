//! Device registry routes, consumed by app clients.
//!
//! All operations are idempotent: repeated register with the same
//! `device_id` updates token and platform; repeated unregister is a no-op.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::{Device, RegisterDevice};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/devices", post(register_device))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}/heartbeat", post(heartbeat_device))
        .route("/api/devices/{id}", delete(unregister_device))
}

/// POST /api/devices — Register (or refresh) a device.
async fn register_device(
    State(state): State<AppState>,
    Json(params): Json<RegisterDevice>,
) -> Result<Json<Device>, AppError> {
    if params.device_id.trim().is_empty() || params.user_id.trim().is_empty() {
        return Err(AppError::Validation(
            "device_id and user_id must not be empty".to_string(),
        ));
    }
    let device = state.registry.register(params)?;
    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
}

/// GET /api/devices?user_id= — All devices registered for a user.
async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<Device>>, AppError> {
    let devices = state.registry.devices_of(&query.user_id)?;
    Ok(Json(devices))
}

#[derive(Debug, Deserialize)]
struct DeviceOwner {
    user_id: String,
}

/// POST /api/devices/:id/heartbeat — Refresh device liveness.
async fn heartbeat_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(owner): Json<DeviceOwner>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.registry.heartbeat(&owner.user_id, &device_id)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// DELETE /api/devices/:id — Unregister a device.
///
/// Pending deliveries for the device are cancelled before this returns.
async fn unregister_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(owner): Json<DeviceOwner>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.registry.unregister(&owner.user_id, &device_id)?;
    Ok(Json(serde_json::json!({"removed": removed})))
}
