//! HTTP surface over the rates engine

pub mod error;
pub mod handlers;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::core::RequestContext;
use crate::core::config::AppConfig;
use crate::engine::RatesEngine;

pub struct AppState {
    pub engine: RatesEngine,
    pub default_base: String,
    pub request_timeout: Duration,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: RatesEngine, config: &AppConfig) -> Self {
        AppState {
            engine,
            default_base: config.default_base.clone(),
            request_timeout: config.request_timeout(),
            started_at: Instant::now(),
        }
    }

    /// Every request gets its own deadline. A client disconnect drops the
    /// handler future, which stops waiting without cancelling a shared round.
    fn request_context(&self) -> RequestContext {
        RequestContext::with_timeout(self.request_timeout)
    }
}

pub fn app_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/rates", get(handlers::get_rates))
        .route("/rates/{base}", get(handlers::get_rates_by_base))
        .route("/convert", get(handlers::convert))
        .route("/providers", get(handlers::providers));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .with_state(state)
}

pub async fn serve(config: &AppConfig, engine: RatesEngine) -> Result<()> {
    let state = Arc::new(AppState::new(engine, config));
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    info!("Listening on {}", config.server.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
