//! Externally triggered refresh cycle.
//!
//! The service has no timer of its own. An external scheduler (systemd
//! timer, cron) runs the `refresh-trigger` binary, which performs one
//! [`RefreshTrigger::run_once`] cycle:
//!
//! 1. refresh the active credential if it is inside the refresh margin
//! 2. prune inactive records beyond the configured maximum
//! 3. purge inactive records older than the retention window
//!
//! Overlapping cycles are safe: every mutation is atomic in the store, so a
//! second concurrent cycle is merely redundant.

use crate::error::OAuthError;
use crate::oauth::{FlowController, RefreshOutcome};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What the refresh step of a cycle did.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleRefresh {
    /// Token refreshed; new expiry.
    Refreshed { expires_at: DateTime<Utc> },
    /// Token outside the margin, left alone.
    StillValid { expires_at: DateTime<Utc> },
    /// No credential on record yet.
    NotAuthenticated,
}

/// Summary of one completed cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct RefreshCycleReport {
    pub refresh: CycleRefresh,
    /// Records removed by the count bound
    pub pruned: usize,
    /// Records removed by the age bound
    pub purged: usize,
}

/// One-shot refresh-and-prune entry point.
pub struct RefreshTrigger {
    controller: Arc<FlowController>,
    inactive_retention: Duration,
}

impl RefreshTrigger {
    pub fn new(controller: Arc<FlowController>, inactive_retention: Duration) -> Self {
        Self {
            controller,
            inactive_retention,
        }
    }

    /// Run one cycle.
    ///
    /// Pruning runs even when the refresh fails; the refresh error is
    /// returned afterwards. Nothing is retried here: the next scheduled
    /// invocation is the retry.
    pub async fn run_once(&self) -> Result<RefreshCycleReport, OAuthError> {
        info!("Running token refresh check");

        let refresh = match self.controller.refresh_if_due().await {
            Ok(RefreshOutcome::Refreshed(record)) => Ok(CycleRefresh::Refreshed {
                expires_at: record.expires_at,
            }),
            Ok(RefreshOutcome::StillValid(record)) => Ok(CycleRefresh::StillValid {
                expires_at: record.expires_at,
            }),
            Err(OAuthError::NotAuthenticated) => {
                warn!("No credential on record; authorization required");
                Ok(CycleRefresh::NotAuthenticated)
            }
            Err(e) => {
                error!(
                    error = %e,
                    reauthorization_required = e.reauthorization_required(),
                    "Token refresh check failed"
                );
                Err(e)
            }
        };

        let store = self.controller.store();
        let pruned = store.prune()?;
        let purged = store.purge_inactive_before(Utc::now() - self.inactive_retention)?;
        info!(pruned, purged, "Old records cleaned up");

        Ok(RefreshCycleReport {
            refresh: refresh?,
            pruned,
            purged,
        })
    }
}
