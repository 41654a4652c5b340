use super::handlers;
use super::AppState;
use crate::config::ServerConfig;
use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub struct ApiServer {
    state: Arc<AppState>,
    config: ServerConfig,
}

impl ApiServer {
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self {
            state: Arc::new(state),
            config,
        }
    }

    pub fn router(&self) -> Router {
        let api_routes = Router::new()
            .route("/analyze", post(handlers::analyze))
            .route("/analyze/raw", post(handlers::analyze_raw))
            .route("/score", post(handlers::score))
            .route("/stats", get(handlers::stats))
            .route("/config/scoring", get(handlers::scoring_config));

        let router = Router::new()
            .route("/health", get(handlers::health))
            .nest("/api/v1", api_routes)
            .layer(DefaultBodyLimit::max(self.config.body_limit_bytes))
            .with_state(self.state.clone());

        if self.config.cors_permissive {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until Ctrl-C or SIGTERM
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen))?;
        log::info!("PhishGuard API listening on {}", self.config.listen);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("API server failed")?;

        log::info!("PhishGuard API stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl-C, shutting down"),
        _ = terminate => log::info!("Received SIGTERM, shutting down"),
    }
}
