//! Token lifecycle controller.
//!
//! Drives one authorization attempt at a time through
//! `Idle → AwaitingCallback → Exchanging → Complete | Failed`, and keeps the
//! stored credential fresh through the refresh grant. Every record mutation
//! goes through the [`TokenStore`]; the controller itself holds no token.

use super::exchange::{ProviderError, TokenClient, TokenGrant};
use super::state_guard::StateGuard;
use crate::error::OAuthError;
use crate::store::{
    normalize_scopes, ActiveUpdate, CredentialRecord, NewCredential, StoreError, TokenStore,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Phase of the most recent authorization attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPhase {
    Idle,
    AwaitingCallback,
    Exchanging,
    Complete,
    Failed,
}

/// Result of a due-check on the active credential.
#[derive(Clone, Debug, PartialEq)]
pub enum RefreshOutcome {
    /// The credential was inside the refresh margin and has been refreshed.
    Refreshed(CredentialRecord),
    /// The credential is outside the margin; nothing was sent to the provider.
    StillValid(CredentialRecord),
}

/// Snapshot of the stored credential, safe to expose (no token material).
#[derive(Clone, Debug, Serialize)]
pub struct TokenStatus {
    /// `no_token`, `active` or `expired`
    pub status: &'static str,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_seconds: Option<i64>,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    pub has_refresh_token: bool,
    pub last_authorization: FlowPhase,
}

/// Whether `record` is due for refresh: it expires within `margin` of `now`.
///
/// The boundary is inclusive, so a token expiring exactly `margin` from now
/// is refreshed.
pub fn needs_refresh(record: &CredentialRecord, now: DateTime<Utc>, margin: Duration) -> bool {
    record.expires_at - now <= margin
}

/// OAuth flow controller: authorization, code exchange and refresh.
pub struct FlowController {
    store: Arc<dyn TokenStore>,
    guard: StateGuard,
    client: TokenClient,
    refresh_margin: Duration,
    phase: Mutex<FlowPhase>,
}

impl FlowController {
    pub fn new(
        store: Arc<dyn TokenStore>,
        guard: StateGuard,
        client: TokenClient,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            store,
            guard,
            client,
            refresh_margin,
            phase: Mutex::new(FlowPhase::Idle),
        }
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub fn guard(&self) -> &StateGuard {
        &self.guard
    }

    /// Phase of the most recent authorization attempt.
    pub fn phase(&self) -> FlowPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: FlowPhase) {
        let mut current = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*current, to = ?phase, "Authorization phase transition");
        *current = phase;
    }

    /// Start an authorization attempt.
    ///
    /// Returns the provider URL the user must be redirected to. Calling this
    /// again before the callback arrives starts a fresh attempt with a new
    /// state; the previous state stays in the guard until it expires.
    pub fn begin_authorization(&self) -> String {
        let state = self.guard.issue();
        let url = self.client.config().build_auth_url(&state.value);
        self.set_phase(FlowPhase::AwaitingCallback);

        info!(expires_at = %state.expires_at, "Authorization started");
        url
    }

    /// End an authorization attempt whose callback cannot be completed
    /// (provider-reported error, missing code).
    ///
    /// The state, if any, is consumed so it cannot be used by a later
    /// callback. The phase becomes `Failed` only when the state was ours.
    pub fn abandon_authorization(&self, state: Option<&str>) {
        let Some(state) = state else {
            return;
        };
        match self.guard.validate(state) {
            Ok(_) => self.set_phase(FlowPhase::Failed),
            Err(rejection) => {
                debug!(reason = rejection.as_str(), "Abandoned callback carried an unusable state")
            }
        }
    }

    /// Complete an authorization attempt from the provider's callback.
    ///
    /// The state is validated (and consumed) before anything else. If it is
    /// refused, the code is never sent to the provider.
    pub async fn handle_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<CredentialRecord, OAuthError> {
        if let Err(rejection) = self.guard.validate(state) {
            warn!(reason = rejection.as_str(), "Rejected OAuth callback state");
            return Err(OAuthError::CsrfValidation(rejection));
        }

        self.set_phase(FlowPhase::Exchanging);

        let grant = match self.client.exchange_code(code).await {
            Ok(grant) => grant,
            Err(e) => {
                error!(error = %e, "Authorization code exchange failed");
                self.set_phase(FlowPhase::Failed);
                return Err(OAuthError::Exchange(e));
            }
        };

        if grant.refresh_token.is_none() {
            warn!("Provider granted no refresh token; the credential cannot be refreshed");
        }

        let credential = match self.new_credential(grant, Utc::now()) {
            Ok(credential) => credential,
            Err(e) => {
                error!(error = %e, "Unusable token grant");
                self.set_phase(FlowPhase::Failed);
                return Err(OAuthError::Exchange(e));
            }
        };
        let record = match self.store.save_new(credential) {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "Failed to store credential");
                self.set_phase(FlowPhase::Failed);
                return Err(e.into());
            }
        };

        self.set_phase(FlowPhase::Complete);
        info!(
            id = record.id,
            expires_at = %record.expires_at,
            has_refresh_token = record.refresh_token.is_some(),
            "OAuth flow completed successfully"
        );
        Ok(record)
    }

    /// Current access token, refreshed first if it is inside the margin.
    pub async fn get_valid_token(&self) -> Result<String, OAuthError> {
        Ok(self.valid_credential().await?.access_token)
    }

    /// The active credential, refreshed first if it is inside the margin.
    ///
    /// If the refresh fails transiently while the current token is still
    /// unexpired, the current record is returned. Rejections always surface.
    pub async fn valid_credential(&self) -> Result<CredentialRecord, OAuthError> {
        let record = self.store.get_active()?;

        if !needs_refresh(&record, Utc::now(), self.refresh_margin) {
            return Ok(record);
        }

        info!(id = record.id, expires_at = %record.expires_at, "Token expiring soon, refreshing");
        match self.refresh().await {
            Ok(refreshed) => Ok(refreshed),
            Err(OAuthError::RefreshFailed(e)) if !record.is_expired_at(Utc::now()) => {
                warn!(error = %e, expires_at = %record.expires_at, "Refresh failed, serving current token");
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh the active credential unconditionally.
    pub async fn refresh(&self) -> Result<CredentialRecord, OAuthError> {
        let record = self.store.get_active()?;
        let refresh_token = record.refresh_token.as_deref().ok_or_else(|| {
            warn!(id = record.id, "Active credential has no refresh token");
            OAuthError::NoRefreshToken
        })?;

        let grant = self.client.refresh(refresh_token).await.map_err(|e| {
            if e.is_rejection() {
                error!(id = record.id, error = %e, "Refresh token rejected, reauthorization required");
                OAuthError::RefreshRejected(e)
            } else {
                warn!(id = record.id, error = %e, "Token refresh failed");
                OAuthError::RefreshFailed(e)
            }
        })?;

        let expires_at = grant.expires_at(Utc::now()).map_err(|e| {
            warn!(id = record.id, error = %e, "Unusable refresh grant");
            OAuthError::RefreshFailed(e)
        })?;

        let update = ActiveUpdate {
            record_id: record.id,
            access_token: grant.access_token,
            expires_at,
            refresh_token: grant.refresh_token,
            scopes: grant.scope.as_deref().map(split_scopes),
            token_type: grant.token_type,
        };
        match self.store.update_active(update) {
            Ok(updated) => {
                info!(id = updated.id, expires_at = %updated.expires_at, "Access token refreshed");
                Ok(updated)
            }
            // A new authorization landed during the round-trip; its grant wins.
            Err(StoreError::Superseded { expected, active }) => {
                warn!(expected, active, "Credential replaced during refresh, discarding refreshed token");
                Ok(self.store.get_active()?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh the active credential only if it is inside the margin.
    pub async fn refresh_if_due(&self) -> Result<RefreshOutcome, OAuthError> {
        let record = self.store.get_active()?;

        if needs_refresh(&record, Utc::now(), self.refresh_margin) {
            Ok(RefreshOutcome::Refreshed(self.refresh().await?))
        } else {
            debug!(id = record.id, expires_at = %record.expires_at, "Token outside refresh margin");
            Ok(RefreshOutcome::StillValid(record))
        }
    }

    /// Describe the stored credential without exposing it.
    pub fn status(&self) -> Result<TokenStatus, OAuthError> {
        let last_authorization = self.phase();

        let record = match self.store.get_active() {
            Ok(record) => record,
            Err(StoreError::NoActiveRecord) => {
                return Ok(TokenStatus {
                    status: "no_token",
                    authenticated: false,
                    record_id: None,
                    expires_at: None,
                    expires_in_seconds: None,
                    scopes: Vec::new(),
                    token_type: None,
                    has_refresh_token: false,
                    last_authorization,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let expired = record.is_expired_at(now);
        Ok(TokenStatus {
            status: if expired { "expired" } else { "active" },
            authenticated: true,
            record_id: Some(record.id),
            expires_at: Some(record.expires_at),
            expires_in_seconds: Some((record.expires_at - now).num_seconds().max(0)),
            scopes: record.scopes,
            token_type: Some(record.token_type),
            has_refresh_token: record.refresh_token.is_some(),
            last_authorization,
        })
    }

    fn new_credential(
        &self,
        grant: TokenGrant,
        now: DateTime<Utc>,
    ) -> Result<NewCredential, ProviderError> {
        let expires_at = grant.expires_at(now)?;
        let scopes = match grant.scope.as_deref() {
            Some(scope) => split_scopes(scope),
            None => normalize_scopes(self.client.config().scopes.iter().cloned()),
        };

        Ok(NewCredential {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at,
            scopes,
            token_type: grant.token_type.unwrap_or_else(|| "Bearer".to_string()),
        })
    }
}

fn split_scopes(scope: &str) -> Vec<String> {
    normalize_scopes(scope.split_whitespace())
}
