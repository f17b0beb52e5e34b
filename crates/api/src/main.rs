// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PaySync API Server
//!
//! HTTP surface for the reconciliation engine: the processor's webhook
//! endpoint, the order-received redirect hook, the scheduled-charge
//! trigger, and the admin capability recheck.

mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use paysync_recon::store::memory::MemoryStore;
use paysync_recon::store::pg::PgStore;
use paysync_recon::{ProcessorConfig, ReconService};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,paysync_api=debug,paysync_recon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PaySync API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ProcessorConfig::from_env()?;
    tracing::info!(sandbox = config.sandbox, "Processor configuration loaded");

    let service = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&database_url)
                .await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            tracing::info!("Database connection established, migrations applied");

            let store = Arc::new(PgStore::new(pool));
            ReconService::new(config, store.clone(), store.clone(), store)?
        }
        Err(_) => {
            // No database configured: volatile in-memory state, suitable for
            // local development only.
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            let store = Arc::new(MemoryStore::new());
            ReconService::new(config, store.clone(), store.clone(), store)?
        }
    };

    let state = AppState::new(service);
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
