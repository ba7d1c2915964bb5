use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod handlers;
pub mod host;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use models::{PendingChange, SaveStatus, SessionKey, SessionMetadata, SessionMetadataUpdate};
pub use services::{AutosaveController, AutosaveError};

/// Router of the development autosave endpoint.
pub fn create_dev_router(state: Arc<services::DevServerState>) -> Router {
    let api_routes = Router::new()
        .route("/autosave", post(handlers::autosave::save_answers))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            middlewares::auth::require_bearer_token,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(middleware::from_fn(
            middlewares::trace::request_id_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}
