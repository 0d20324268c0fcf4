use anyhow::Context;
use deep_research::api::{build_router, AppState};
use deep_research::research::Collaborators;
use deep_research::{telemetry, Config, ResearchOrchestrator};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    telemetry::init_tracing(&config.logging);

    let collaborators =
        Collaborators::from_config(&config).context("failed to initialize collaborators")?;
    let orchestrator = Arc::new(ResearchOrchestrator::new(collaborators, &config));

    let app = build_router(AppState { orchestrator }, config.server.max_body_bytes);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("Deep research service listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
