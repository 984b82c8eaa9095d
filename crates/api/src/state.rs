//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_engine::Pipeline;
use herald_notifier::DeadLetterStore;
use herald_registry::{DeviceRegistry, MembershipStore};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub registry: Arc<DeviceRegistry>,
    pub membership: Arc<MembershipStore>,
    pub dead_letters: Arc<DeadLetterStore>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        registry: Arc<DeviceRegistry>,
        membership: Arc<MembershipStore>,
        dead_letters: Arc<DeadLetterStore>,
        config: AppConfig,
    ) -> Self {
        Self {
            pipeline,
            registry,
            membership,
            dead_letters,
            config,
        }
    }
}
