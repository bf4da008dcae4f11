use std::sync::Arc;

use anyhow::Context;

use wattloop_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wattloop_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let (services, background) = wattloop_api::app::build_services(&config).await?;
    let app = wattloop_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    background.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
