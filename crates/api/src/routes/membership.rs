//! Membership version webhook, fed by the billing collaborator.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{EventType, RawEvent};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/membership/version", post(version_changed))
}

#[derive(Debug, Deserialize)]
struct VersionChange {
    user_id: String,
    version: u64,
    #[serde(default)]
    plan: Option<String>,
}

/// POST /api/membership/version — onVersionChanged(userId, version).
///
/// Commits the version to the store, then feeds a critical
/// MembershipChanged event into the pipeline. A non-advancing version is
/// acknowledged without generating an event.
async fn version_changed(
    State(state): State<AppState>,
    Json(change): Json<VersionChange>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if change.user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id must not be empty".to_string()));
    }

    let advanced = state.membership.bump(&change.user_id, change.version);
    if !advanced {
        return Ok((
            StatusCode::OK,
            Json(serde_json::json!({"accepted": false, "reason": "version did not advance"})),
        ));
    }

    let mut payload = serde_json::json!({"membership_version": change.version});
    if let Some(plan) = change.plan
        && let Some(obj) = payload.as_object_mut()
    {
        obj.insert("plan".to_string(), serde_json::json!(plan));
    }

    let event = state.pipeline.submit_raw(RawEvent {
        id: Uuid::new_v4(),
        user_id: change.user_id,
        event_type: EventType::MembershipChanged,
        payload,
        occurred_at: Utc::now(),
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": true, "event_id": event.id})),
    ))
}
