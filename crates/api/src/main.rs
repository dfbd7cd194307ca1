//! NovaVid API Server
//!
//! Entry point: load config, connect Postgres, run migrations, serve.

use std::net::SocketAddr;

use novavid_api::{create_router, ApiConfig, AppState};
use novavid_ledger::{LedgerService, PgLedgerStore};
use novavid_shared::create_pool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,novavid_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting NovaVid API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ApiConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;

    let ledger = LedgerService::from_env(pool);
    ledger.store.migrate().await?;
    tracing::info!("Migrations applied");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = create_router(AppState::new(ledger, config));

    tracing::info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
