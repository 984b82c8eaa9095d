//! StreamHerald API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_engine::gate::ConsistencyGate;
use herald_engine::pipeline::Pipeline;
use herald_notifier::{
    DeadLetterStore, DeliveryConfig, DeliveryService, LoggingTransport, PushTransport,
    WebhookTransport,
};
use herald_registry::{DeviceRegistry, MembershipStore};

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=debug,herald_notifier=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting StreamHerald API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Core services
    let registry = Arc::new(DeviceRegistry::new(config.registry_shards));
    let membership = Arc::new(MembershipStore::new());
    let gate = Arc::new(ConsistencyGate::new(membership.clone()));
    let dead_letters = Arc::new(DeadLetterStore::new(config.dead_letter_capacity));

    let transport: Arc<dyn PushTransport> = match &config.webhook_endpoint {
        Some(endpoint) => {
            tracing::info!(endpoint = %endpoint, "Using webhook push transport");
            Arc::new(WebhookTransport::new(endpoint.clone()))
        }
        None => {
            tracing::warn!("WEBHOOK_ENDPOINT not set, deliveries are logged and acked");
            Arc::new(LoggingTransport)
        }
    };

    let delivery = Arc::new(DeliveryService::new(
        transport,
        registry.clone(),
        gate.clone(),
        dead_letters.clone(),
        DeliveryConfig::from_app(&config),
    ));
    // Unregister must cancel pending deliveries before it returns.
    registry.add_unregister_hook(delivery.task_table());

    let pipeline = Arc::new(Pipeline::new(
        &config,
        registry.clone(),
        gate,
        delivery.clone(),
    ));

    delivery.start();
    pipeline.start();
    tracing::info!("Fan-out pipeline started");

    // Build application state
    let state = AppState::new(
        pipeline,
        registry,
        membership,
        dead_letters,
        config.clone(),
    );

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
