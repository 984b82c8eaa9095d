//! Recommendation-ready batch feed from the daily ML job.

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
    Router::new().route("/api/recommendations/ready", post(recommendations_ready))
}

#[derive(Debug, Deserialize)]
struct ReadyBatch {
    user_ids: Vec<String>,
}

/// POST /api/recommendations/ready — recommendationsReady(userId) batch.
///
/// Each user becomes one important-priority event; fan-out is released as a
/// rate-limited stream by the pipeline's drain, never a single burst.
async fn recommendations_ready(
    State(state): State<AppState>,
    Json(batch): Json<ReadyBatch>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if batch.user_ids.is_empty() {
        return Err(AppError::Validation("user_ids must not be empty".to_string()));
    }

    let mut accepted = 0u64;
    for user_id in batch.user_ids {
        if user_id.trim().is_empty() {
            continue;
        }
        state.pipeline.submit_raw(RawEvent {
            id: Uuid::new_v4(),
            user_id,
            event_type: EventType::RecommendationsReady,
            payload: serde_json::json!({"batch": "daily"}),
            occurred_at: Utc::now(),
        })?;
        accepted += 1;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": accepted})),
    ))
}
