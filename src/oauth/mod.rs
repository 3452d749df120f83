//! OAuth 2.0 authorization-code flow against the identity provider.
//!
//! Implements the authorization code flow:
//! 1. GET /oauth/google/start → [`FlowController::begin_authorization`] → redirect to provider
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to /oauth/google/callback with `code` and `state`
//! 4. [`StateGuard`] consumes the state, then the code is exchanged for tokens
//! 5. The credential is stored as the single active record
//!
//! Afterwards [`FlowController::refresh`] keeps the access token valid using
//! the refresh grant, on demand or from the external refresh trigger.

mod exchange;
mod flow;
mod provider;
mod state_guard;

pub use exchange::{ProviderError, Rejection, TokenClient, TokenGrant};
pub use flow::{needs_refresh, FlowController, FlowPhase, RefreshOutcome, TokenStatus};
pub use provider::{ProviderConfig, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL};
pub use state_guard::{run_state_cleanup, StateGuard, StateRejection, StateToken};
