//! Event ingress route.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_common::types::RawEvent;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/events", post(ingest_event))
}

/// POST /api/events — Accept a domain event into the pipeline.
///
/// Malformed events are rejected synchronously with a validation error and
/// never enter the pipeline. Accepted events return 202 with the assigned
/// priority.
async fn ingest_event(
    State(state): State<AppState>,
    Json(raw): Json<RawEvent>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let event = state.pipeline.submit_raw(raw)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "id": event.id,
            "priority": event.priority,
        })),
    ))
}
