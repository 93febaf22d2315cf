use anyhow::Context;

use swarmrouter_api::app::{build_app, services};
use swarmrouter_infra::RouterConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    swarmrouter_observability::init();

    let config = RouterConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr();

    let services = services::build_services(config)
        .await
        .context("failed to initialize services")?;
    let workers = services.start_workers();

    // Entries whose anchoring did not finish before the last shutdown.
    let catch_up = services.router.clone();
    tokio::spawn(async move {
        match catch_up.anchor_pending_ledger_events().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(anchored = n, "anchored pending ledger events"),
            Err(err) => tracing::warn!(error = %err, "pending ledger event catch-up failed"),
        }
    });

    let app = build_app(services.router.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(addr = %listener.local_addr()?, "swarmrouter listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    for worker in workers {
        let name = worker.name();
        worker.shutdown().await;
        tracing::info!(worker = name, "worker stopped");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
