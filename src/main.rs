use std::process;
use std::sync::Arc;

use chat_bridge::config::AppConfig;
use chat_bridge::provider::GeminiClient;
use chat_bridge::{build_app, run_server, AppState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_bridge=info,tower_http=info")),
        )
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            process::exit(1);
        }
    };

    let model = config.gemini.model.clone();
    let client = match GeminiClient::new(config.gemini) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "failed to build provider client");
            process::exit(1);
        }
    };
    info!(%model, mode = ?config.mode, output = ?config.output, "provider client ready");

    let state = AppState::new(Arc::new(client), config.mode, config.output);
    if let Err(err) = run_server(build_app(state), config.port).await {
        error!(error = %err, "server failed");
        process::exit(1);
    }
}
