//! Dead-letter inspection endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use herald_notifier::DeadLetter;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/dead-letters", get(list_dead_letters))
}

/// GET /api/dead-letters — Terminal failures retained for offline
/// inspection, oldest first.
async fn list_dead_letters(State(state): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(state.dead_letters.list())
}
