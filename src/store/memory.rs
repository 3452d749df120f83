//! In-memory credential storage.

use super::{ActiveUpdate, CredentialRecord, NewCredential, StoreError, TokenStore};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

/// In-memory token store for tests and embedding.
///
/// Records are lost when the process exits. Every operation runs under a
/// single mutex, which gives the same atomicity as the SQLite transactions.
pub struct MemoryTokenStore {
    inner: Mutex<Inner>,
    max_inactive: usize,
}

struct Inner {
    next_id: i64,
    records: Vec<CredentialRecord>,
}

impl MemoryTokenStore {
    /// Create an empty store keeping at most `max_inactive` inactive records on prune.
    pub fn new(max_inactive: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                records: Vec::new(),
            }),
            max_inactive,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|e| StoreError::Storage {
            message: format!("lock poisoned: {}", e),
        })
    }
}

impl std::fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.lock().map(|i| i.records.len()).unwrap_or(0);
        f.debug_struct("MemoryTokenStore")
            .field("records", &count)
            .field("max_inactive", &self.max_inactive)
            .finish()
    }
}

impl TokenStore for MemoryTokenStore {
    fn save_new(&self, credential: NewCredential) -> Result<CredentialRecord, StoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        for record in inner.records.iter_mut().filter(|r| r.is_active) {
            record.is_active = false;
            record.updated_at = now;
        }

        let record = CredentialRecord {
            id: inner.next_id,
            access_token: credential.access_token,
            refresh_token: credential.refresh_token,
            expires_at: credential.expires_at,
            scopes: credential.scopes,
            token_type: credential.token_type,
            created_at: now,
            updated_at: now,
            is_active: true,
        };
        inner.next_id += 1;
        inner.records.push(record.clone());

        Ok(record)
    }

    fn update_active(&self, update: ActiveUpdate) -> Result<CredentialRecord, StoreError> {
        let mut inner = self.lock()?;
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.is_active)
            .ok_or(StoreError::NoActiveRecord)?;
        if record.id != update.record_id {
            return Err(StoreError::Superseded {
                expected: update.record_id,
                active: record.id,
            });
        }

        record.access_token = update.access_token;
        record.expires_at = update.expires_at;
        if let Some(refresh_token) = update.refresh_token {
            record.refresh_token = Some(refresh_token);
        }
        if let Some(scopes) = update.scopes {
            record.scopes = scopes;
        }
        if let Some(token_type) = update.token_type {
            record.token_type = token_type;
        }
        record.updated_at = Utc::now();

        Ok(record.clone())
    }

    fn get_active(&self) -> Result<CredentialRecord, StoreError> {
        self.lock()?
            .records
            .iter()
            .find(|r| r.is_active)
            .cloned()
            .ok_or(StoreError::NoActiveRecord)
    }

    fn prune(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;

        let mut inactive: Vec<(DateTime<Utc>, i64)> = inner
            .records
            .iter()
            .filter(|r| !r.is_active)
            .map(|r| (r.created_at, r.id))
            .collect();
        if inactive.len() <= self.max_inactive {
            return Ok(0);
        }

        // Oldest first; everything before the newest `max_inactive` goes.
        inactive.sort();
        let excess = inactive.len() - self.max_inactive;
        let doomed: Vec<i64> = inactive[..excess].iter().map(|(_, id)| *id).collect();

        inner.records.retain(|r| !doomed.contains(&r.id));
        Ok(excess)
    }

    fn purge_inactive_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let before = inner.records.len();
        inner
            .records
            .retain(|r| r.is_active || r.created_at >= cutoff);
        Ok(before - inner.records.len())
    }

    fn list(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let mut records = self.lock()?.records.clone();
        records.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(records)
    }
}
