// Credential records and persistence
pub mod store;

// OAuth flow: state guard, provider client, controller
pub mod oauth;

// Error taxonomy
pub mod error;

// Configuration
pub mod config;

// HTTP API
pub mod api;

// Externally triggered refresh cycle
pub mod trigger;

// Component wiring
pub mod service;
