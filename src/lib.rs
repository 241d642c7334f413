// Chat Gateway - local HTTP gateway in front of LLM chat-completion vendors

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = config::resolve_config_path();
    let config = config::load_or_default(&config_path);

    let env_file = config::resolve_env_file(&config);
    let credentials = auth::CredentialStore::load(&env_file)?;
    tracing::info!("Credential file: {:?}", credentials.path());

    let state = api::AppState::new(&config, credentials)?;
    api::start_server(&config, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
