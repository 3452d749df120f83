//! OAuth HTTP endpoints.
//!
//! - `GET /oauth/google/start`    → 302 to the provider's consent page
//! - `GET /oauth/google/callback` → code exchange, stores the credential
//! - `GET /oauth/google/token`    → current valid access token
//! - `GET /oauth/google/status`   → credential metadata (never the token)

use crate::error::OAuthError;
use crate::oauth::{FlowController, ProviderError, StateRejection, TokenStatus};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    error_code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Application error types for OAuth endpoints
#[derive(Debug)]
enum AppError {
    BadRequest(&'static str, String),
    InvalidState(StateRejection, String),
    /// Provider refusal, with the provider's own description as details
    ProviderRejected(StatusCode, &'static str, String, Option<String>),
    Unauthorized(&'static str, String),
    Conflict(&'static str, String),
    BadGateway(&'static str, String),
    ServerError(&'static str, String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut reason = None;
        let mut details = None;
        let (status, error_code, error_message) = match self {
            AppError::BadRequest(code, msg) => (StatusCode::BAD_REQUEST, code, msg),
            AppError::InvalidState(rejection, msg) => {
                reason = Some(rejection.as_str());
                (StatusCode::BAD_REQUEST, "invalid_state", msg)
            }
            AppError::ProviderRejected(status, code, msg, provider_details) => {
                details = provider_details;
                (status, code, msg)
            }
            AppError::Unauthorized(code, msg) => (StatusCode::UNAUTHORIZED, code, msg),
            AppError::Conflict(code, msg) => (StatusCode::CONFLICT, code, msg),
            AppError::BadGateway(code, msg) => (StatusCode::BAD_GATEWAY, code, msg),
            AppError::ServerError(code, msg) => (StatusCode::INTERNAL_SERVER_ERROR, code, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            error_code,
            reason,
            details,
        });

        (status, body).into_response()
    }
}

impl From<OAuthError> for AppError {
    fn from(e: OAuthError) -> Self {
        let message = e.to_string();
        match e {
            OAuthError::CsrfValidation(rejection) => AppError::InvalidState(rejection, message),
            OAuthError::Exchange(ProviderError::Rejected(rejection)) => AppError::ProviderRejected(
                StatusCode::BAD_REQUEST,
                "token_exchange_failed",
                message,
                Some(rejection.description.unwrap_or(rejection.error)),
            ),
            OAuthError::Exchange(_) => AppError::BadGateway("provider_unavailable", message),
            OAuthError::NotAuthenticated => AppError::Unauthorized("not_authenticated", message),
            OAuthError::NoRefreshToken => AppError::Conflict("no_refresh_token", message),
            OAuthError::RefreshRejected(ProviderError::Rejected(rejection)) => AppError::ProviderRejected(
                StatusCode::CONFLICT,
                "refresh_rejected",
                message,
                Some(rejection.description.unwrap_or(rejection.error)),
            ),
            OAuthError::RefreshRejected(_) => AppError::Conflict("refresh_rejected", message),
            OAuthError::RefreshFailed(_) => AppError::BadGateway("refresh_failed", message),
            OAuthError::Storage(_) => AppError::ServerError("storage_error", message),
        }
    }
}

/// Shared application state for OAuth API
#[derive(Clone)]
pub struct OAuthAppState {
    pub controller: Arc<FlowController>,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// OAuth success response
#[derive(Serialize)]
pub struct OAuthSuccessResponse {
    status: &'static str,
    message: String,
    expires_at: DateTime<Utc>,
    scopes: Vec<String>,
}

/// Access token response
#[derive(Serialize)]
pub struct AccessTokenResponse {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Create OAuth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/oauth/google/start", get(oauth_start))
        .route("/oauth/google/callback", get(oauth_callback))
        .route("/oauth/google/token", get(oauth_token))
        .route("/oauth/google/status", get(oauth_status))
        .with_state(Arc::new(state))
}

/// GET /oauth/google/start
///
/// Redirects the user to the provider's authorization page with a fresh
/// single-use CSRF state.
async fn oauth_start(State(state): State<Arc<OAuthAppState>>) -> Response {
    debug!("OAuth start requested");

    let auth_url = state.controller.begin_authorization();

    info!("Redirecting to OAuth provider");
    (StatusCode::FOUND, [(header::LOCATION, auth_url)]).into_response()
}

/// GET /oauth/google/callback
///
/// Exchanges the authorization code for tokens and stores the credential.
///
/// # Security
/// - Validates CSRF state parameter before touching the code
/// - Single-use state (consumed on validation, whatever the outcome)
async fn oauth_callback(
    State(state): State<Arc<OAuthAppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<OAuthSuccessResponse>, AppError> {
    debug!("OAuth callback received");

    // Provider-reported errors (user denied consent, ...)
    if let Some(error) = callback.error {
        state.controller.abandon_authorization(callback.state.as_deref());
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "OAuth authorization failed");
        return Err(AppError::BadRequest(
            "oauth_error",
            format!("OAuth authorization failed: {} - {}", error, description),
        ));
    }

    let Some(code) = callback.code else {
        warn!("Missing OAuth code");
        state.controller.abandon_authorization(callback.state.as_deref());
        return Err(AppError::BadRequest(
            "missing_code",
            "Missing 'code' parameter".to_string(),
        ));
    };
    let csrf_state = callback.state.ok_or_else(|| {
        warn!("Missing state parameter");
        AppError::BadRequest("missing_state", "Missing 'state' parameter".to_string())
    })?;

    let record = state
        .controller
        .handle_callback(&code, &csrf_state)
        .await
        .map_err(|e| {
            error!(error = %e, "OAuth callback failed");
            AppError::from(e)
        })?;

    Ok(Json(OAuthSuccessResponse {
        status: "success",
        message: "OAuth successful!".to_string(),
        expires_at: record.expires_at,
        scopes: record.scopes,
    }))
}

/// GET /oauth/google/token
///
/// Returns a valid access token, refreshing first when it is close to expiry.
/// May block on a provider round-trip.
async fn oauth_token(
    State(state): State<Arc<OAuthAppState>>,
) -> Result<Json<AccessTokenResponse>, AppError> {
    let record = state.controller.valid_credential().await.map_err(|e| {
        if e.reauthorization_required() {
            warn!(error = %e, "Token requested but reauthorization is required");
        } else {
            error!(error = %e, "Failed to get token");
        }
        AppError::from(e)
    })?;

    Ok(Json(AccessTokenResponse {
        access_token: record.access_token,
        expires_at: record.expires_at,
    }))
}

/// GET /oauth/google/status
///
/// Always 200; `status` distinguishes `no_token` from `expired`.
async fn oauth_status(
    State(state): State<Arc<OAuthAppState>>,
) -> Result<Json<TokenStatus>, AppError> {
    let status = state.controller.status().map_err(|e| {
        error!(error = %e, "Failed to get token status");
        AppError::from(e)
    })?;

    Ok(Json(status))
}
