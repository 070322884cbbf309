mod handlers;
mod models;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::AppState;

#[allow(unused_imports)]
pub use handlers::{ask, health, not_found, preflight, root, STREAM_ERROR_PREFIX};
#[allow(unused_imports)]
pub use models::{AskRequest, AskResponse, ErrorResponse, HealthResponse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ask", post(ask).options(preflight))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
