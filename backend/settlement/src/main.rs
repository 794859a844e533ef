//! Donation settlement service: entry point.
//!
//! Starts a background reconciler that polls the ledger for inbound
//! donations and settles them, and exposes a small Axum REST API for
//! frontend / admin consumption.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use settlement::api::{self, ApiState};
use settlement::config::Config;
use settlement::db;
use settlement::engine::Engine;
use settlement::ledger::http::HttpLedger;
use settlement::reconciler::{self, ReconcilerState, Settings};
use settlement::retry::BackoffPolicy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    let ledger = HttpLedger::new(
        client,
        &config.ledger_url,
        &config.ledger_token,
        &config.client_id,
    );
    let engine = Arc::new(Engine::new(
        Arc::new(ledger),
        config.client_id.clone(),
        config.spend_key.clone(),
        BackoffPolicy::default(),
    ));

    for asset in &config.consolidate_assets {
        match engine.consolidate(asset).await {
            Ok(left) => info!("Asset {asset}: {left} unspent outputs after consolidation"),
            Err(e) => warn!("Consolidating {asset} failed: {e}"),
        }
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutdown requested");
            cancel.cancel();
        });
    }

    // ─── Background reconciler ────────────────────────────
    let reconciler_state = Arc::new(ReconcilerState {
        pool: pool.clone(),
        engine: engine.clone(),
        settings: Settings::from(&config),
    });
    let reconciler = tokio::spawn(reconciler::run(reconciler_state, cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(ApiState { pool, engine });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/projects", get(api::list_projects))
        .route("/projects/:item", get(api::get_project))
        .route("/projects/:item/donations", get(api::get_project_donations))
        .route("/users/:identity", get(api::get_user))
        .route("/users/:identity/donations", get(api::get_user_donations))
        .route("/settlement/cursor", get(api::get_cursor))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    // The server can also stop on its own; take the reconciler down with it.
    cancel.cancel();
    reconciler.await?;
    info!("Settlement service stopped");

    Ok(())
}
