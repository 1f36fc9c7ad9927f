//! HTTP surface: `GET /health` and `POST /extract`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rate_limit;

use crate::config::{Config, ServerConfig};
use crate::pipeline::ClipPipeline;
use crate::storage::S3Publisher;
use rate_limit::RateLimitState;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ClipPipeline>,
    pub api_key: Option<String>,
    pub debug_errors: bool,
    pub rate_limit: RateLimitState,
    /// Cancelled when the process shuts down
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(pipeline: Arc<ClipPipeline>, config: &ServerConfig, shutdown: CancellationToken) -> Self {
        Self {
            pipeline,
            api_key: config.service_api_key.clone(),
            debug_errors: config.debug_errors,
            rate_limit: RateLimitState::new(config.rate_limit_per_minute, config.trust_proxy),
            shutdown,
        }
    }
}

/// Build the API router
pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    let protected = Router::new()
        .route("/extract", post(handlers::extract))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.rate_limit.clone(),
            rate_limit::rate_limit,
        ))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the service until ctrl-c
pub async fn serve(config: Config) -> crate::Result<()> {
    let publisher = S3Publisher::new(&config.storage)
        .await
        .context("Object storage is not configured")?;
    let pipeline = ClipPipeline::from_config(&config, Arc::new(publisher))?;

    fs_err::tokio::create_dir_all(&config.pipeline.temp_dir).await?;

    if config.server.service_api_key.is_none() {
        tracing::warn!("SERVICE_API_KEY is not set; /extract will reject every request");
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(Arc::new(pipeline), &config.server, shutdown.clone());
    let app = create_router(state, config.server.max_body_bytes);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(
        %addr,
        concurrency = config.pipeline.concurrency,
        temp_dir = %config.pipeline.temp_dir.display(),
        "ytclip listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await
    .context("Server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
        // Keep serving rather than stopping immediately
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
    shutdown.cancel();
}
