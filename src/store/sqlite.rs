//! Credential record storage using SQLite.
//!
//! One table, `tokens`, holds every record. A partial unique index on the
//! `is_active` flag makes the single-active invariant part of the on-disk
//! contract, so other tools reading the database can rely on it.

use super::{ActiveUpdate, CredentialRecord, NewCredential, StoreError, TokenStore};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "id, access_token, refresh_token, expires_at, scope, token_type, \
                              created_at, updated_at, is_active";

/// Credential store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE tokens (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     access_token TEXT NOT NULL,
///     refresh_token TEXT,              -- optional
///     expires_at TEXT NOT NULL,        -- RFC 3339, UTC, microseconds
///     scope TEXT NOT NULL,             -- space separated
///     token_type TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     is_active INTEGER NOT NULL DEFAULT 0
/// );
/// CREATE UNIQUE INDEX idx_tokens_single_active ON tokens(is_active) WHERE is_active = 1;
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in a Mutex, so writes within one process are serialized
/// - Writes use IMMEDIATE transactions, so writes across processes are serialized too
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
    max_inactive: usize,
}

impl SqliteTokenStore {
    /// Creates or opens a token store at `db_path`.
    ///
    /// `max_inactive` bounds how many inactive records `prune` keeps.
    pub fn open<P: AsRef<Path>>(db_path: P, max_inactive: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at TEXT NOT NULL,
                scope TEXT NOT NULL,
                token_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_single_active
                ON tokens(is_active) WHERE is_active = 1;
            CREATE INDEX IF NOT EXISTS idx_tokens_created_at ON tokens(created_at);
            "#,
        )?;

        tracing::debug!(max_inactive, "Token store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            max_inactive,
        })
    }

    /// Opens a private in-memory database. Useful for tests.
    pub fn in_memory(max_inactive: usize) -> Result<Self, StoreError> {
        Self::open(":memory:", max_inactive)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Storage {
            message: format!("connection lock poisoned: {}", e),
        })
    }
}

impl TokenStore for SqliteTokenStore {
    fn save_new(&self, credential: NewCredential) -> Result<CredentialRecord, StoreError> {
        let now = timestamp(Utc::now());
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let deactivated = tx.execute(
            "UPDATE tokens SET is_active = 0, updated_at = ?1 WHERE is_active = 1",
            params![now],
        )?;

        tx.execute(
            r#"
            INSERT INTO tokens (
                access_token, refresh_token, expires_at, scope, token_type,
                created_at, updated_at, is_active
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1)
            "#,
            params![
                credential.access_token,
                credential.refresh_token,
                timestamp(credential.expires_at),
                credential.scopes.join(" "),
                credential.token_type,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();

        let record = select_by_id(&tx, id)?;
        tx.commit()?;

        tracing::info!(id, deactivated, "Stored new active credential");
        Ok(record)
    }

    fn update_active(&self, update: ActiveUpdate) -> Result<CredentialRecord, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let id: i64 = tx
            .query_row("SELECT id FROM tokens WHERE is_active = 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or(StoreError::NoActiveRecord)?;
        if id != update.record_id {
            return Err(StoreError::Superseded {
                expected: update.record_id,
                active: id,
            });
        }

        let scope = update.scopes.map(|s| s.join(" "));
        tx.execute(
            r#"
            UPDATE tokens SET
                access_token = ?1,
                expires_at = ?2,
                refresh_token = COALESCE(?3, refresh_token),
                scope = COALESCE(?4, scope),
                token_type = COALESCE(?5, token_type),
                updated_at = ?6
            WHERE id = ?7
            "#,
            params![
                update.access_token,
                timestamp(update.expires_at),
                update.refresh_token,
                scope,
                update.token_type,
                timestamp(Utc::now()),
                id,
            ],
        )?;

        let record = select_by_id(&tx, id)?;
        tx.commit()?;

        tracing::info!(id, expires_at = %record.expires_at, "Updated active credential");
        Ok(record)
    }

    fn get_active(&self) -> Result<CredentialRecord, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM tokens WHERE is_active = 1", SELECT_COLUMNS);
        conn.query_row(&sql, [], read_record)
            .optional()?
            .ok_or(StoreError::NoActiveRecord)
    }

    fn prune(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            r#"
            DELETE FROM tokens
            WHERE is_active = 0 AND id NOT IN (
                SELECT id FROM tokens
                WHERE is_active = 0
                ORDER BY created_at DESC, id DESC
                LIMIT ?1
            )
            "#,
            params![self.max_inactive as i64],
        )?;

        if deleted > 0 {
            tracing::info!(deleted, max_inactive = self.max_inactive, "Pruned inactive credentials");
        }
        Ok(deleted)
    }

    fn purge_inactive_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM tokens WHERE is_active = 0 AND created_at < ?1",
            params![timestamp(cutoff)],
        )?;

        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "Purged old inactive credentials");
        }
        Ok(deleted)
    }

    fn list(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM tokens ORDER BY created_at DESC, id DESC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([], read_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}

/// Fixed-width RFC 3339 so that text comparison orders chronologically.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn select_by_id(conn: &Connection, id: i64) -> Result<CredentialRecord, StoreError> {
    let sql = format!("SELECT {} FROM tokens WHERE id = ?1", SELECT_COLUMNS);
    Ok(conn.query_row(&sql, params![id], read_record)?)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<CredentialRecord> {
    let scope: String = row.get(4)?;
    Ok(CredentialRecord {
        id: row.get(0)?,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        expires_at: parse_timestamp(row, 3)?,
        scopes: scope.split_whitespace().map(str::to_string).collect(),
        token_type: row.get(5)?,
        created_at: parse_timestamp(row, 6)?,
        updated_at: parse_timestamp(row, 7)?,
        is_active: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_store(max_inactive: usize) -> SqliteTokenStore {
        SqliteTokenStore::in_memory(max_inactive).expect("Failed to create test store")
    }

    fn credential(access_token: &str) -> NewCredential {
        NewCredential {
            access_token: access_token.to_string(),
            refresh_token: Some(format!("{}-refresh", access_token)),
            expires_at: Utc::now() + Duration::hours(1),
            scopes: vec!["openid".to_string(), "email".to_string()],
            token_type: "Bearer".to_string(),
        }
    }

    fn active_count(store: &SqliteTokenStore) -> usize {
        store
            .list()
            .unwrap()
            .iter()
            .filter(|r| r.is_active)
            .count()
    }

    #[test]
    fn test_save_and_get_active() {
        let store = create_test_store(10);

        let saved = store.save_new(credential("first")).unwrap();
        let active = store.get_active().unwrap();

        assert_eq!(active.id, saved.id);
        assert_eq!(active.access_token, "first");
        assert_eq!(active.refresh_token, Some("first-refresh".to_string()));
        assert_eq!(active.scopes, vec!["openid", "email"]);
        assert!(active.is_active);
    }

    #[test]
    fn test_get_active_empty() {
        let store = create_test_store(10);
        assert!(matches!(store.get_active(), Err(StoreError::NoActiveRecord)));
    }

    #[test]
    fn test_save_new_deactivates_previous() {
        let store = create_test_store(10);

        let first = store.save_new(credential("first")).unwrap();
        let second = store.save_new(credential("second")).unwrap();

        assert!(second.id > first.id);
        assert_eq!(store.get_active().unwrap().id, second.id);
        assert_eq!(active_count(&store), 1);

        let records = store.list().unwrap();
        let old = records.iter().find(|r| r.id == first.id).unwrap();
        assert!(!old.is_active);
    }

    #[test]
    fn test_update_active_preserves_identity_and_refresh_token() {
        let store = create_test_store(10);
        let saved = store.save_new(credential("first")).unwrap();

        let new_expiry = Utc::now() + Duration::hours(2);
        let updated = store
            .update_active(ActiveUpdate {
                record_id: saved.id,
                access_token: "rotated".to_string(),
                expires_at: new_expiry,
                refresh_token: None,
                scopes: None,
                token_type: None,
            })
            .unwrap();

        assert_eq!(updated.id, saved.id);
        assert_eq!(updated.access_token, "rotated");
        assert_eq!(updated.refresh_token, Some("first-refresh".to_string()));
        assert_eq!(updated.scopes, saved.scopes);
        assert!(updated.expires_at > saved.expires_at);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_update_active_replaces_rotated_refresh_token() {
        let store = create_test_store(10);
        let saved = store.save_new(credential("first")).unwrap();

        let updated = store
            .update_active(ActiveUpdate {
                record_id: saved.id,
                access_token: "rotated".to_string(),
                expires_at: Utc::now() + Duration::hours(1),
                refresh_token: Some("new-refresh".to_string()),
                scopes: Some(vec!["email".to_string()]),
                token_type: Some("bearer".to_string()),
            })
            .unwrap();

        assert_eq!(updated.refresh_token, Some("new-refresh".to_string()));
        assert_eq!(updated.scopes, vec!["email"]);
        assert_eq!(updated.token_type, "bearer");
    }

    #[test]
    fn test_update_active_without_record() {
        let store = create_test_store(10);
        let result = store.update_active(ActiveUpdate {
            record_id: 1,
            access_token: "x".to_string(),
            expires_at: Utc::now(),
            refresh_token: None,
            scopes: None,
            token_type: None,
        });
        assert!(matches!(result, Err(StoreError::NoActiveRecord)));
    }

    #[test]
    fn test_update_active_refuses_superseded_record() {
        let store = create_test_store(10);
        let first = store.save_new(credential("first")).unwrap();
        let second = store.save_new(credential("second")).unwrap();

        let result = store.update_active(ActiveUpdate {
            record_id: first.id,
            access_token: "late".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            refresh_token: Some("late-refresh".to_string()),
            scopes: Some(vec!["late".to_string()]),
            token_type: None,
        });
        assert!(matches!(
            result,
            Err(StoreError::Superseded { expected, active }) if expected == first.id && active == second.id
        ));

        let active = store.get_active().unwrap();
        assert_eq!(active.access_token, "second");
        assert_eq!(active.refresh_token, Some("second-refresh".to_string()));
        assert_eq!(active.scopes, second.scopes);
    }

    #[test]
    fn test_prune_keeps_newest_inactive() {
        let store = create_test_store(2);
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.save_new(credential(&format!("t{}", i))).unwrap().id);
        }

        // 4 inactive, max 2
        let deleted = store.prune().unwrap();
        assert_eq!(deleted, 2);

        let remaining: Vec<i64> = store.list().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec![ids[4], ids[3], ids[2]]);
        assert_eq!(store.get_active().unwrap().id, ids[4]);
    }

    #[test]
    fn test_prune_zero_max_keeps_active() {
        let store = create_test_store(0);
        store.save_new(credential("a")).unwrap();
        let active = store.save_new(credential("b")).unwrap();

        assert_eq!(store.prune().unwrap(), 1);
        let records = store.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, active.id);
    }

    #[test]
    fn test_purge_inactive_before() {
        let store = create_test_store(10);
        store.save_new(credential("old")).unwrap();
        let active = store.save_new(credential("current")).unwrap();

        // Nothing is older than an hour ago
        assert_eq!(store.purge_inactive_before(Utc::now() - Duration::hours(1)).unwrap(), 0);

        // Everything inactive is older than an hour from now; active survives
        assert_eq!(store.purge_inactive_before(Utc::now() + Duration::hours(1)).unwrap(), 1);
        assert_eq!(store.get_active().unwrap().id, active.id);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.db");

        let saved = {
            let store = SqliteTokenStore::open(&path, 10).unwrap();
            store.save_new(credential("durable")).unwrap()
        };

        let store = SqliteTokenStore::open(&path, 10).unwrap();
        let active = store.get_active().unwrap();
        assert_eq!(active.id, saved.id);
        assert_eq!(active.access_token, "durable");
    }

    #[test]
    fn test_second_active_row_rejected_on_disk() {
        let store = create_test_store(10);
        store.save_new(credential("a")).unwrap();

        let conn = store.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO tokens (access_token, expires_at, scope, token_type, created_at, updated_at, is_active)
             VALUES ('x', '2030-01-01T00:00:00.000000Z', '', 'Bearer', '2030-01-01T00:00:00.000000Z', '2030-01-01T00:00:00.000000Z', 1)",
            [],
        );
        assert!(result.is_err());
    }
}
