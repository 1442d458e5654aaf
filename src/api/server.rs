//! HTTP API server

use axum::{
    routing::{delete, get},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::config::ApiConfig;
use crate::error::{Error, NetworkError, Result};
use crate::server::ServerContext;

/// Read-mostly JSON view of the running server
pub struct ApiServer {
    config: ApiConfig,
    ctx: Arc<ServerContext>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, ctx: Arc<ServerContext>) -> Self {
        Self { config, ctx }
    }

    /// Build the router
    pub fn router(ctx: Arc<ServerContext>) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/endpoints", get(handlers::get_endpoints))
            .route("/api/endpoints/:id", delete(handlers::delete_endpoint))
            .route("/api/sessions", get(handlers::get_sessions))
            .layer(CorsLayer::permissive())
            .with_state(ctx)
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("API bind address: {e}")))
    }

    /// Serve until the task is dropped.
    pub async fn run(self) -> Result<()> {
        let addr = self.addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{addr}: {e}")))?;

        tracing::info!("HTTP API listening on http://{}", addr);
        axum::serve(listener, Self::router(self.ctx)).await?;
        Ok(())
    }

    /// Spawn the server on the current tokio runtime.
    pub fn start_background(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("HTTP API stopped: {}", e);
            }
        })
    }
}
