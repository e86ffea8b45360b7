//! Deposit–donation reconciler — entry point.
//!
//! Matches uploaded bank transfers against donors' pledges, turns exact
//! matches into confirmed donations and runs the admin deletion workflow.
//! Follow-up work is driven by an in-process event bus; a background sweep
//! times out unpaid pledges. A small Axum REST API exposes the operations.

mod api;
mod config;
mod db;
mod deposit;
mod donation;
mod effects;
mod errors;
mod events;
mod expiry;
mod fsm;
mod locks;
mod matching;
mod notify;
mod provisional;
mod reactor;
mod reconciliation;
mod refund;
mod saga;
mod state;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use events::EventBus;
use notify::SqliteNotifier;
use state::ServiceState;

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

    let (bus, rx) = EventBus::new();
    let notifier = Arc::new(SqliteNotifier::new(pool.clone()));
    let service = ServiceState::new(pool, bus, notifier);
    let cancel = CancellationToken::new();

    // ─── Background tasks ─────────────────────────────────
    let reactor = tokio::spawn(reactor::run(service.clone(), rx, cancel.clone()));
    let sweeper = tokio::spawn(expiry::run(service.clone(), config.clone(), cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { service });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/pledges", post(api::create_pledge))
        .route("/deposits", post(api::upload_deposit))
        .route("/deposits/:id", axum::routing::delete(api::delete_deposit))
        .route("/deposits/:id/deletion", get(api::get_deletion))
        .route("/donations/:id/refund", post(api::request_refund))
        .route("/donations/:id/refund/cancel", post(api::cancel_refund))
        .route("/donations/:id/refund/assign", post(api::assign_refund))
        .route("/donations/:id/refund/complete", post(api::complete_refund))
        .route("/users/:id/notifications", get(api::get_notifications))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = tokio::join!(reactor, sweeper);
    info!("Reconciler stopped");
    Ok(())
}
