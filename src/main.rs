//! Barfeed - market-data ingestion orchestrator
//!
//! Keeps the relational bar store continuously fresh for every watched
//! symbol and timeframe: a per-minute coordinator derives missing coverage,
//! enqueues deduplicated slices, and dispatches bounded workers against
//! rate-limited providers. Chart reads are served straight from the store.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use barfeed_backend::api;
use barfeed_backend::clock::now_utc;
use barfeed_backend::middleware::logging::request_logging;
use barfeed_backend::models::Config;
use barfeed_backend::orchestrator::scheduler;
use barfeed_backend::providers::ProviderSet;
use barfeed_backend::state::AppState;
use barfeed_backend::store::Db;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 Barfeed ingestion orchestrator starting");

    let config = Config::from_env();
    let db_path = resolve_data_path(&config.database_path);
    let db = Db::open(&db_path)?;

    let providers = ProviderSet::from_config(&config).context("provider setup failed")?;
    if config.alpaca_api_key.is_none()
        && config.polygon_api_key.is_none()
        && config.tradier_api_key.is_none()
    {
        info!("⚠️  No provider credentials configured; only yfinance will serve fetches");
    }

    let state = AppState::new(config.clone(), db.clone(), providers);
    state
        .rate
        .seed_defaults(&config, now_utc())
        .context("rate bucket seeding failed")?;

    // Per-minute orchestrator tick plus the administrative sweep.
    scheduler::spawn_tick_loop(state.clone());
    scheduler::spawn_maintenance_loop(state.clone(), db);

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Initialize tracing with env-filter control.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "barfeed_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory so
    // running with --manifest-path from elsewhere still finds the file.
    let _ = dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

/// Anchor relative database paths to the crate directory, not the caller's
/// working directory, so running from elsewhere never creates a second DB.
fn resolve_data_path(raw: &str) -> String {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return raw.to_string();
    }
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join(p)
        .to_string_lossy()
        .to_string()
}
