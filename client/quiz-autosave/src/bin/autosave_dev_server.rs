use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quiz_autosave::{config::Config, create_dev_router, services::DevServerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quiz_autosave=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting autosave development server");

    let config = Config::load().context("Failed to load configuration")?;
    if config.dev_server.auth_token.is_none() {
        tracing::warn!("No dev_server.auth_token configured, accepting unauthenticated saves");
    }

    let state = Arc::new(DevServerState::new(config.dev_server.auth_token.clone()));
    let app = create_dev_router(state);

    let listener = tokio::net::TcpListener::bind(&config.dev_server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.dev_server.bind_addr))?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down autosave development server");
        })
        .await
        .context("Server error")?;

    Ok(())
}
