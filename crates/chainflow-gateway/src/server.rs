use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use chainflow_core::config::GatewayConfig;
use chainflow_engine::SessionRunner;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway over a session runner, built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    runner: SessionRunner,
}

/// The gateway's routes over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/node-types", get(routes::node_types))
        .route("/api/validate", post(routes::validate))
        .route("/api/prediction", post(routes::prediction))
        .route("/api/sessions/{id}", delete(routes::forget_session))
        .route("/api/sessions/{id}/history", get(routes::session_history))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, runner: SessionRunner) -> Self {
        Self { config, runner }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            runner: self.runner.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
