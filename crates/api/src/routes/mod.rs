pub mod dead_letters;
pub mod devices;
pub mod events;
pub mod health;
pub mod membership;
pub mod recommendations;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(events::router())
        .merge(devices::router())
        .merge(membership::router())
        .merge(recommendations::router())
        .merge(dead_letters::router())
        .with_state(state)
}
