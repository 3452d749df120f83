//! Component wiring shared by the server and the refresh trigger.

use crate::config::KeeperConfig;
use crate::oauth::{FlowController, StateGuard, TokenClient};
use crate::store::{SqliteTokenStore, TokenStore};
use crate::trigger::RefreshTrigger;
use anyhow::{Context, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::info;

/// Fully wired service components.
pub struct Service {
    pub config: KeeperConfig,
    pub store: Arc<dyn TokenStore>,
    pub controller: Arc<FlowController>,
}

impl Service {
    /// Open the credential database and build the controller from a validated config.
    pub fn open(config: KeeperConfig) -> Result<Self> {
        let store: Arc<dyn TokenStore> = Arc::new(
            SqliteTokenStore::open(&config.storage.db_path, config.storage.max_inactive_records)
                .with_context(|| {
                    format!(
                        "Failed to open token store at {}",
                        config.storage.db_path.display()
                    )
                })?,
        );
        info!(db_path = %config.storage.db_path.display(), "Token store initialized");

        Self::with_store(config, store)
    }

    /// Build the controller around an existing store.
    pub fn with_store(config: KeeperConfig, store: Arc<dyn TokenStore>) -> Result<Self> {
        let client = TokenClient::new(
            config.provider.to_provider_config(),
            std::time::Duration::from_secs(config.provider.request_timeout_seconds),
        )
        .context("Failed to build token endpoint client")?;

        let controller = Arc::new(FlowController::new(
            Arc::clone(&store),
            StateGuard::new(config.state.ttl_seconds),
            client,
            Duration::seconds(config.refresh.margin_seconds),
        ));

        Ok(Self {
            config,
            store,
            controller,
        })
    }

    pub fn refresh_trigger(&self) -> RefreshTrigger {
        RefreshTrigger::new(
            Arc::clone(&self.controller),
            Duration::days(self.config.storage.inactive_retention_days),
        )
    }
}
