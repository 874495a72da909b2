//! MentionBridge binary entry point

use std::sync::Arc;

use mentionbridge::silo::SiloClients;
use mentionbridge::tasks::QueueDispatcher;
use mentionbridge::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState and the task runner
/// 4. Resume polling for listening accounts
/// 5. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("MENTIONBRIDGE__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "mentionbridge=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "mentionbridge=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting MentionBridge...");

    // 2. Initialize metrics
    mentionbridge::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state and start the task runner
    let (dispatcher, receiver) = QueueDispatcher::new();
    let state = AppState::new(config.clone(), SiloClients::new(), Arc::new(dispatcher)).await?;
    tokio::spawn(state.task_runner().run(receiver));

    // 5. Resume polling
    let resumed = state.resume_polling().await?;
    tracing::info!(accounts = resumed, "Polling resumed");

    // 6. Start HTTP server
    let app = mentionbridge::build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}
