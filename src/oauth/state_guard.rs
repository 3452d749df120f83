//! OAuth state management for CSRF protection.
//!
//! Issues single-use state values for the authorization step and validates
//! them on callback. A value is good for exactly one validation attempt.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Random bytes per state value (256 bits).
const STATE_BYTES: usize = 32;

/// An issued state value and its validity window.
#[derive(Clone, Debug, PartialEq)]
pub struct StateToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Why a state value was refused. Every variant is terminal for that value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateRejection {
    /// Never issued by this process, or already cleaned up.
    NotFound,
    /// Issued, but the authorization window has closed.
    Expired,
    /// Already presented once.
    AlreadyConsumed,
}

impl StateRejection {
    /// Short machine-readable reason, used in API error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            StateRejection::NotFound => "not_found",
            StateRejection::Expired => "expired",
            StateRejection::AlreadyConsumed => "already_consumed",
        }
    }
}

impl fmt::Display for StateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateRejection::NotFound => write!(f, "unknown state parameter"),
            StateRejection::Expired => write!(f, "state parameter expired"),
            StateRejection::AlreadyConsumed => write!(f, "state parameter already used"),
        }
    }
}

struct StateEntry {
    token: StateToken,
    consumed: bool,
}

/// Single-use state guard with automatic expiration.
#[derive(Clone)]
pub struct StateGuard {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    ttl: Duration,
}

impl StateGuard {
    /// Create a new guard.
    ///
    /// # Arguments
    /// * `ttl_seconds` - How long states remain valid (default: 600 = 10 minutes)
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Issue a new state value and hold it pending validation.
    pub fn issue(&self) -> StateToken {
        self.issue_at(Utc::now())
    }

    pub fn issue_at(&self, now: DateTime<Utc>) -> StateToken {
        let token = StateToken {
            value: generate_state_value(),
            issued_at: now,
            expires_at: now + self.ttl,
        };

        let mut states = self.lock();
        states.retain(|_, entry| now <= entry.token.expires_at);
        states.insert(
            token.value.clone(),
            StateEntry {
                token: token.clone(),
                consumed: false,
            },
        );

        token
    }

    /// Validate and consume a state value.
    ///
    /// Returns the issued token if it was pending and unexpired. Whatever the
    /// outcome, the value can never validate again.
    pub fn validate(&self, value: &str) -> Result<StateToken, StateRejection> {
        self.validate_at(value, Utc::now())
    }

    pub fn validate_at(&self, value: &str, now: DateTime<Utc>) -> Result<StateToken, StateRejection> {
        let mut states = self.lock();
        let entry = states.get_mut(value).ok_or(StateRejection::NotFound)?;

        if entry.consumed {
            return Err(StateRejection::AlreadyConsumed);
        }
        entry.consumed = true;

        if now > entry.token.expires_at {
            return Err(StateRejection::Expired);
        }

        Ok(entry.token.clone())
    }

    /// Drop every entry whose window has closed, consumed or not.
    ///
    /// Returns how many entries were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut states = self.lock();
        let before = states.len();
        states.retain(|_, entry| now <= entry.token.expires_at);
        before - states.len()
    }

    /// Number of values issued and not yet presented.
    pub fn pending_count(&self) -> usize {
        self.lock().values().filter(|e| !e.consumed).count()
    }

    // The map holds no cross-entry invariant a panicking holder could break.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, StateEntry>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generate_state_value() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(guard: StateGuard, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let removed = guard.cleanup_expired();
        tracing::debug!(
            removed,
            pending = guard.pending_count(),
            "OAuth state cleanup complete"
        );
    }
}
