//! Durable storage for OAuth credential records.
//!
//! The store owns every [`CredentialRecord`] the service has ever obtained and
//! enforces two invariants on them:
//!
//! - at most one record is active at any time
//! - inactive records are bounded, oldest evicted first
//!
//! ```text
//! ┌──────────────────────────────┐
//! │   FlowController (writer)    │
//! └──────────────────────────────┘
//!          ↓ save_new / update_active / prune
//! ┌──────────────────────────────┐
//! │   TokenStore trait           │
//! │   - SqliteTokenStore         │
//! │   - MemoryTokenStore         │
//! └──────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use oauth_keeper::store::{NewCredential, SqliteTokenStore, TokenStore};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> Result<(), oauth_keeper::store::StoreError> {
//! let store = SqliteTokenStore::open("google_oauth.db", 10)?;
//!
//! let record = store.save_new(NewCredential {
//!     access_token: "ya29.access".to_string(),
//!     refresh_token: Some("1//refresh".to_string()),
//!     expires_at: Utc::now() + Duration::hours(1),
//!     scopes: vec!["openid".to_string()],
//!     token_type: "Bearer".to_string(),
//! })?;
//! assert!(record.is_active);
//!
//! let active = store.get_active()?;
//! assert_eq!(active.id, record.id);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::MemoryTokenStore;
pub use sqlite::SqliteTokenStore;

/// A persisted OAuth credential.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CredentialRecord {
    /// Monotonic identifier assigned by the store
    pub id: i64,

    /// Access token (used for API requests)
    #[serde(skip_serializing)]
    pub access_token: String,

    /// Refresh token, absent when the provider never granted one
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,

    /// Granted scopes, in grant order, without duplicates
    pub scopes: Vec<String>,

    /// Token type reported by the provider (normally "Bearer")
    pub token_type: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Exactly one record may be active at a time
    pub is_active: bool,
}

impl CredentialRecord {
    /// Whether the access token has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Fields for a credential obtained from a fresh authorization.
#[derive(Clone, Debug)]
pub struct NewCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub token_type: String,
}

/// In-place changes applied to the active record after a refresh.
///
/// `None` fields keep the stored value. Providers may not rotate refresh
/// tokens, so an absent `refresh_token` keeps the current one.
#[derive(Clone, Debug)]
pub struct ActiveUpdate {
    /// Record the refreshed grant belongs to; must still be the active one.
    pub record_id: i64,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub token_type: Option<String>,
}

/// Errors raised by token store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record is currently active.
    #[error("no active credential record")]
    NoActiveRecord,

    /// The record an update was computed from is no longer the active one.
    #[error("credential record {expected} was superseded by record {active}")]
    Superseded { expected: i64, active: i64 },

    /// The storage backend failed.
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage {
            message: e.to_string(),
        }
    }
}

/// Abstraction over credential record storage.
///
/// Implementations serialize their own mutations: callers never need a lock
/// of their own to keep the single-active invariant.
pub trait TokenStore: Send + Sync {
    /// Inserts `credential` as the new active record, deactivating the
    /// previous one in the same atomic step.
    fn save_new(&self, credential: NewCredential) -> Result<CredentialRecord, StoreError>;

    /// Mutates the active record in place, preserving its identity.
    ///
    /// Fails with [`StoreError::NoActiveRecord`] if nothing is active, and
    /// with [`StoreError::Superseded`] if the active record is not
    /// `update.record_id`. Nothing is written in either case.
    fn update_active(&self, update: ActiveUpdate) -> Result<CredentialRecord, StoreError>;

    /// Returns the active record or [`StoreError::NoActiveRecord`].
    fn get_active(&self) -> Result<CredentialRecord, StoreError>;

    /// Deletes inactive records beyond the configured maximum, oldest first
    /// by `created_at`. Never touches the active record.
    ///
    /// Returns the number of records deleted.
    fn prune(&self) -> Result<usize, StoreError>;

    /// Deletes inactive records created before `cutoff`.
    fn purge_inactive_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Lists all records, newest first.
    fn list(&self) -> Result<Vec<CredentialRecord>, StoreError>;
}

/// Removes duplicate scopes, keeping the first occurrence of each.
pub fn normalize_scopes<I, S>(scopes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for scope in scopes {
        let scope = scope.into();
        if !scope.is_empty() && !out.contains(&scope) {
            out.push(scope);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_scopes_dedups_in_order() {
        let scopes = normalize_scopes(["email", "openid", "email", "", "profile"]);
        assert_eq!(scopes, vec!["email", "openid", "profile"]);
    }

    #[test]
    fn test_record_serialization_hides_tokens() {
        let now = Utc::now();
        let record = CredentialRecord {
            id: 7,
            access_token: "secret-access".to_string(),
            refresh_token: Some("secret-refresh".to_string()),
            expires_at: now,
            scopes: vec!["email".to_string()],
            token_type: "Bearer".to_string(),
            created_at: now,
            updated_at: now,
            is_active: true,
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"id\":7"));
        assert!(!json.contains("secret-access"));
        assert!(!json.contains("secret-refresh"));
    }
}
