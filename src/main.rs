//! ledger-core - Transactional Ledger Engine API
//!
//! A bank-grade core ledger: accounts, cards and crypto positions mutated
//! through optimistic-concurrency operations that leave an immutable,
//! replayable audit trail.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, Router};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledger_core::api::{self, AppState};
use ledger_core::domain::{Currency, Money, Symbol};
use ledger_core::engine::LedgerEngine;
use ledger_core::jobs::{JobScheduler, JobSchedulerConfig};
use ledger_core::oracle::FixedRateOracle;
use ledger_core::query::QueryService;
use ledger_core::store::{EntityStore, MemoryStore, PostgresStore};
use ledger_core::Config;

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the application router
fn build_router(state: AppState) -> Router {
    // Create API router with all routes
    let api_router = api::create_router();

    // Apply middleware to API routes
    // Note: Axum layers are applied in reverse order (last added = first executed)
    // Order: identity -> logging -> handler
    let protected_routes = api_router
        .layer(middleware::from_fn(api::middleware::logging_middleware))
        .layer(middleware::from_fn(api::middleware::identity_middleware));

    Router::new()
        // Health check (no auth)
        .route("/health", axum::routing::get(health_check))
        // Protected API routes
        .nest("/api/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Development rates for the fixed oracle. A live deployment would swap in
/// a feed-backed `PriceOracle` implementation here.
fn seed_oracle(oracle: &FixedRateOracle) -> anyhow::Result<()> {
    oracle.set_crypto_rate(
        Symbol::new("BTC")?,
        Money::new(9_850_000_00, Currency::aud()),
    );
    oracle.set_crypto_rate(
        Symbol::new("ETH")?,
        Money::new(520_000_00, Currency::aud()),
    );
    // 1 USD = 1.55 AUD and its reciprocal
    oracle.set_fiat_rate(Currency::usd(), Currency::aud(), Decimal::new(155, 2));
    oracle.set_fiat_rate(Currency::aud(), Currency::usd(), Decimal::new(645, 3));
    tracing::info!("fixed-rate oracle seeded with development rates");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_tracing();

    // Load configuration
    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!("Starting ledger-core server");

    // Select the entity store
    let store: Arc<dyn EntityStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(url)
                .await?;
            let store = PostgresStore::new(pool);
            store.migrate().await?;
            tracing::info!("Database connected successfully");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; state lives in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let oracle = Arc::new(FixedRateOracle::default());
    seed_oracle(&oracle)?;

    let engine = Arc::new(
        LedgerEngine::new(store.clone(), oracle.clone()).with_retry(config.retry_policy()),
    );
    let query = Arc::new(QueryService::new(store.clone(), oracle));
    let state = AppState::new(engine, query);

    // Background maintenance
    let scheduler = JobScheduler::with_config(
        store,
        JobSchedulerConfig {
            maintenance_interval: Duration::from_secs(config.maintenance_interval_secs),
        },
    );
    let scheduler_handle = scheduler.start();

    tracing::info!("Listening on http://{}", addr);

    // Build router and start server
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("Server shutting down...");
    scheduler_handle.abort();
    tracing::info!("Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
