//! SproutCV Billing Service - HTTP API for credits and payments
//!
//! This is the main entry point for the sprout-billing service.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sprout_billing_service::{create_router, AppState, ExpirySweeper, ServiceConfig};
use sprout_billing_store::{PgStore, Store};

/// Connections in the PostgreSQL pool.
const PG_MAX_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sprout_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting SproutCV Billing Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        postgres_configured = %config.database_url.is_some(),
        dodo_configured = %config.dodo_api_key.is_some(),
        webhook_secret_configured = %config.dodo_webhook_secret.is_some(),
        payment_timeout_secs = config.payment_timeout_seconds,
        "Service configuration loaded"
    );

    let store = open_store(&config).await?;

    // Build app state
    let state = AppState::new(store, config.clone());

    ExpirySweeper::new(
        Arc::clone(&state.reconciler),
        Duration::from_secs(config.expiry_sweep_seconds),
    )
    .spawn();

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// PostgreSQL when `DATABASE_URL` is set, otherwise `RocksDB`.
async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    if let Some(url) = &config.database_url {
        tracing::info!("Connecting to PostgreSQL store");
        let store = PgStore::connect(url, PG_MAX_CONNECTIONS).await?;
        store.migrate().await?;
        return Ok(Arc::new(store));
    }

    #[cfg(feature = "rocksdb-backend")]
    {
        tracing::info!(path = %config.data_dir, "Opening RocksDB store");
        Ok(Arc::new(sprout_billing_store::RocksStore::open(&config.data_dir)?))
    }

    #[cfg(not(feature = "rocksdb-backend"))]
    {
        tracing::warn!(
            "No DATABASE_URL and RocksDB backend disabled - using in-memory store, \
             data will not persist"
        );
        Ok(Arc::new(sprout_billing_store::MemoryStore::new()))
    }
}
