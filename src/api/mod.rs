// HTTP API

pub mod oauth;

pub use oauth::{create_oauth_router, OAuthAppState};
