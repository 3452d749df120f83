//! Error types for the token lifecycle.

use thiserror::Error;

use crate::oauth::{ProviderError, StateRejection};
use crate::store::StoreError;

/// Errors surfaced by the OAuth flow controller.
///
/// None of these are retried internally. The variants that require a human
/// to run the authorization flow again report so via
/// [`OAuthError::reauthorization_required`].
#[derive(Debug, Error)]
pub enum OAuthError {
    /// The callback's state parameter was not one we issued, or not anymore.
    #[error("state validation failed: {0}")]
    CsrfValidation(StateRejection),

    /// The provider refused or failed the authorization code exchange.
    #[error("authorization code exchange failed: {0}")]
    Exchange(ProviderError),

    /// No credential has been obtained yet.
    #[error("not authenticated: authorization flow has not completed")]
    NotAuthenticated,

    /// The active credential cannot be refreshed: the provider never granted a refresh token.
    #[error("active credential has no refresh token; reauthorization required")]
    NoRefreshToken,

    /// The provider refused the refresh token (revoked or expired).
    #[error("refresh token rejected; reauthorization required: {0}")]
    RefreshRejected(ProviderError),

    /// The refresh request failed for a reason that may go away (network, 5xx).
    #[error("token refresh failed: {0}")]
    RefreshFailed(ProviderError),

    /// The token store failed.
    #[error(transparent)]
    Storage(StoreError),
}

impl OAuthError {
    /// Whether the caller must send the user through `start` again.
    pub fn reauthorization_required(&self) -> bool {
        matches!(
            self,
            OAuthError::NotAuthenticated | OAuthError::NoRefreshToken | OAuthError::RefreshRejected(_)
        )
    }
}

impl From<StoreError> for OAuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NoActiveRecord => OAuthError::NotAuthenticated,
            other => OAuthError::Storage(other),
        }
    }
}
