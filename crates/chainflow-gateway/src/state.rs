use chainflow_core::config::GatewayConfig;
use chainflow_engine::SessionRunner;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub runner: SessionRunner,
}
