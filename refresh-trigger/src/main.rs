//! One refresh-and-prune cycle, meant to be run by an external timer
//! (systemd timer, cron). Exits non-zero if the cycle fails.

use anyhow::{Context, Result};
use oauth_keeper::config::KeeperConfig;
use oauth_keeper::service::Service;
use oauth_keeper::trigger::CycleRefresh;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refresh_trigger=info,oauth_keeper=info".into()),
        )
        .init();

    let config = KeeperConfig::load().context("Failed to load configuration")?;
    let service = Service::open(config)?;

    let report = service
        .refresh_trigger()
        .run_once()
        .await
        .context("Refresh cycle failed")?;

    match report.refresh {
        CycleRefresh::Refreshed { expires_at } => {
            info!(expires_at = %expires_at, "Access token refreshed")
        }
        CycleRefresh::StillValid { expires_at } => {
            info!(expires_at = %expires_at, "Access token still valid")
        }
        CycleRefresh::NotAuthenticated => {
            warn!("No stored credential; complete the authorization flow first")
        }
    }
    info!(
        pruned = report.pruned,
        purged = report.purged,
        "Refresh cycle complete"
    );

    Ok(())
}
