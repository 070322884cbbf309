pub mod api;
pub mod config;
pub mod provider;

use std::sync::Arc;

use axum::Router;
use tracing::info;

use crate::config::{AskMode, OutputFormat};
use crate::provider::GenerationProvider;

pub use crate::api::STREAM_ERROR_PREFIX;

/// Request-independent state shared by every handler. Read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub provider: Option<Arc<dyn GenerationProvider>>,
    pub mode: AskMode,
    pub output: OutputFormat,
}

impl AppState {
    pub fn new(provider: Arc<dyn GenerationProvider>, mode: AskMode, output: OutputFormat) -> Self {
        Self {
            provider: Some(provider),
            mode,
            output,
        }
    }

    /// State with no provider client; `/health` and `/ask` report 500.
    pub fn unconfigured(mode: AskMode, output: OutputFormat) -> Self {
        Self {
            provider: None,
            mode,
            output,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    api::router(state)
}

pub async fn run_server(app: Router, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "chat bridge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
