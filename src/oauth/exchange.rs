//! OAuth token endpoint client.
//!
//! Handles exchanging authorization codes and refresh tokens for access tokens.

use super::provider::ProviderConfig;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Longest access token lifetime accepted from the provider (one year).
const MAX_EXPIRES_IN: i64 = 366 * 24 * 60 * 60;

/// Successful token endpoint response (standard OAuth 2.0)
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    /// Space separated granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

fn default_expires_in() -> i64 {
    DEFAULT_EXPIRES_IN
}

impl TokenGrant {
    /// Absolute expiry of the granted access token, counted from `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ProviderError> {
        if !(0..=MAX_EXPIRES_IN).contains(&self.expires_in) {
            return Err(ProviderError::MalformedResponse(format!(
                "expires_in out of range: {}",
                self.expires_in
            )));
        }
        chrono::Duration::try_seconds(self.expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                ProviderError::MalformedResponse(format!(
                    "expires_in out of range: {}",
                    self.expires_in
                ))
            })
    }
}

/// Error body returned by the token endpoint (RFC 6749 §5.2)
#[derive(Deserialize, Debug)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Failure talking to the provider's token endpoint.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with a client error (bad code, revoked refresh token, ...).
    #[error("{0}")]
    Rejected(Rejection),

    /// The provider could not be reached or answered with a server error.
    #[error("token endpoint unavailable: {0}")]
    Transport(String),

    /// The provider answered 2xx with a body we could not read.
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// True when the provider refused the grant itself, as opposed to being unreachable.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ProviderError::Rejected(_))
    }
}

/// Provider-side refusal, with the provider's own error code and description.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub status: u16,
    pub error: String,
    pub description: Option<String>,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider returned {} ({})", self.error, self.status)?;
        if let Some(description) = &self.description {
            write!(f, ": {}", description)?;
        }
        Ok(())
    }
}

/// Client for the provider's token endpoint.
#[derive(Clone, Debug)]
pub struct TokenClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl TokenClient {
    pub fn new(config: ProviderConfig, request_timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ProviderError> {
        tracing::debug!(token_url = %self.config.token_url, "Exchanging authorization code for token");

        let grant = self
            .post_token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .await?;

        tracing::debug!(
            has_refresh_token = grant.refresh_token.is_some(),
            expires_in = grant.expires_in,
            "Token exchange successful"
        );
        Ok(grant)
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        tracing::debug!(token_url = %self.config.token_url, "Refreshing access token");

        let grant = self
            .post_token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .await?;

        tracing::debug!(
            rotated_refresh_token = grant.refresh_token.is_some(),
            expires_in = grant.expires_in,
            "Token refresh successful"
        );
        Ok(grant)
    }

    async fn post_token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to read response body: {}", e)))?;

        if status.is_client_error() {
            return Err(ProviderError::Rejected(parse_rejection(status.as_u16(), &body)));
        }
        if !status.is_success() {
            return Err(ProviderError::Transport(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let grant: TokenGrant = serde_json::from_str(&body)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        grant.expires_at(Utc::now())?;
        Ok(grant)
    }
}

fn parse_rejection(status: u16, body: &str) -> Rejection {
    match serde_json::from_str::<TokenErrorBody>(body) {
        Ok(parsed) => Rejection {
            status,
            error: parsed.error,
            description: parsed.error_description,
        },
        Err(_) => Rejection {
            status,
            error: "http_error".to_string(),
            description: (!body.is_empty()).then(|| body.to_string()),
        },
    }
}
