use anyhow::{Context, Result};
use chrono::Utc;
use oauth_keeper::api::{create_oauth_router, OAuthAppState};
use oauth_keeper::config::KeeperConfig;
use oauth_keeper::oauth::run_state_cleanup;
use oauth_keeper::service::Service;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oauth_keeper=info".into()),
        )
        .init();

    info!("OAuth keeper starting...");

    let config = KeeperConfig::load().context("Failed to load configuration")?;
    info!(
        db_path = %config.storage.db_path.display(),
        bind = %config.server.bind,
        refresh_margin_seconds = config.refresh.margin_seconds,
        "Configuration loaded"
    );

    let service = Service::open(config)?;

    // Startup cleanup, same bounds as the refresh trigger
    let pruned = service.store.prune().context("Failed to prune token records")?;
    let cutoff = Utc::now() - chrono::Duration::days(service.config.storage.inactive_retention_days);
    let purged = service
        .store
        .purge_inactive_before(cutoff)
        .context("Failed to purge old token records")?;
    info!(pruned, purged, "Startup cleanup complete");

    match service.controller.status() {
        Ok(status) => info!(status = status.status, "Stored credential checked"),
        Err(e) => warn!(error = %e, "Failed to read stored credential"),
    }

    // Background task: drop expired CSRF states
    let cleanup_handle = tokio::spawn(run_state_cleanup(
        service.controller.guard().clone(),
        service.config.state.cleanup_interval_seconds,
    ));

    let router = create_oauth_router(OAuthAppState {
        controller: Arc::clone(&service.controller),
    });
    let listener = tokio::net::TcpListener::bind(&service.config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", service.config.server.bind))?;
    info!(bind = %service.config.server.bind, "OAuth API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl_c signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("OAuth API server error")?;

    cleanup_handle.abort();
    info!("OAuth keeper stopped");

    Ok(())
}
