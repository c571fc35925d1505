//! SQLite-backed session store
//!
//! One row per session; the token stream is stored as a JSON array. The claim
//! is a single conditional `UPDATE ... RETURNING`, so two processes sharing a
//! database file can never both win the same tick. Commits and transitions
//! run inside `BEGIN IMMEDIATE` so the read-check-write is serialized against
//! every other writer.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info};

use super::{SessionStore, StoreError};
use crate::domain::{ProgressCommit, Session, SessionStatus, StatusTransition, Token};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "id, owner_id, target_document_id, tokens, total_word_count, token_cursor, \
    applied_word_count, status, tick_interval_ms, started_at, deadline_at, next_eligible_at, \
    nap_until, last_error, created_at, updated_at, claimed_until";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id                  TEXT PRIMARY KEY,
    owner_id            TEXT NOT NULL,
    target_document_id  TEXT NOT NULL,
    tokens              TEXT NOT NULL,
    total_word_count    INTEGER NOT NULL,
    token_cursor        INTEGER NOT NULL,
    applied_word_count  INTEGER NOT NULL,
    status              TEXT NOT NULL,
    tick_interval_ms    INTEGER NOT NULL,
    started_at          INTEGER NOT NULL,
    deadline_at         INTEGER NOT NULL,
    next_eligible_at    INTEGER,
    nap_until           INTEGER,
    last_error          TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    claimed_until       INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sessions_due ON sessions (status, next_eligible_at);
";

/// Raw column values before JSON and enum decoding
struct SessionRow {
    id: String,
    owner_id: String,
    target_document_id: String,
    tokens: String,
    total_word_count: i64,
    cursor: i64,
    applied_word_count: i64,
    status: String,
    tick_interval_ms: i64,
    started_at: i64,
    deadline_at: i64,
    next_eligible_at: Option<i64>,
    nap_until: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
    claimed_until: Option<i64>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            target_document_id: row.get(2)?,
            tokens: row.get(3)?,
            total_word_count: row.get(4)?,
            cursor: row.get(5)?,
            applied_word_count: row.get(6)?,
            status: row.get(7)?,
            tick_interval_ms: row.get(8)?,
            started_at: row.get(9)?,
            deadline_at: row.get(10)?,
            next_eligible_at: row.get(11)?,
            nap_until: row.get(12)?,
            last_error: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            claimed_until: row.get(16)?,
        })
    }

    fn into_session(self) -> Result<Session, StoreError> {
        let tokens: Vec<Token> = serde_json::from_str(&self.tokens)?;
        let status: SessionStatus = self.status.parse().map_err(|detail| StoreError::Corrupt {
            id: self.id.clone(),
            detail,
        })?;
        let count = |value: i64, field: &str| {
            usize::try_from(value).map_err(|_| StoreError::Corrupt {
                id: self.id.clone(),
                detail: format!("negative {}: {}", field, value),
            })
        };

        Ok(Session {
            total_word_count: count(self.total_word_count, "total_word_count")?,
            cursor: count(self.cursor, "token_cursor")?,
            applied_word_count: count(self.applied_word_count, "applied_word_count")?,
            id: self.id,
            owner_id: self.owner_id,
            target_document_id: self.target_document_id,
            tokens,
            status,
            tick_interval_ms: self.tick_interval_ms,
            started_at: self.started_at,
            deadline_at: self.deadline_at,
            next_eligible_at: self.next_eligible_at,
            nap_until: self.nap_until,
            claimed_until: self.claimed_until,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn select_one(conn: &Connection, id: &str) -> Result<Option<Session>, StoreError> {
    let sql = format!("SELECT {} FROM sessions WHERE id = ?1", COLUMNS);
    let row = conn.query_row(&sql, params![id], SessionRow::from_row).optional()?;
    row.map(SessionRow::into_session).transpose()
}

/// Write every mutable column of an existing row; returns rows changed
fn write_progress(conn: &Connection, session: &Session) -> Result<usize, StoreError> {
    let changed = conn.execute(
        "UPDATE sessions SET
            token_cursor = ?2,
            applied_word_count = ?3,
            status = ?4,
            next_eligible_at = ?5,
            nap_until = ?6,
            last_error = ?7,
            updated_at = ?8,
            claimed_until = ?9
         WHERE id = ?1",
        params![
            session.id,
            session.cursor as i64,
            session.applied_word_count as i64,
            session.status.as_str(),
            session.next_eligible_at,
            session.nap_until,
            session.last_error,
            session.updated_at,
            session.claimed_until,
        ],
    )?;
    Ok(changed)
}

/// SQLite-backed [`SessionStore`]
///
/// Every statement runs on the blocking pool so a busy database never stalls
/// the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "SqliteStore::open: called");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(%mode, "SqliteStore::open: journal mode");
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("SqliteStore::open_in_memory: called");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;
        info!("Session store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut conn)
        })
        .await?
    }
}

/// Databases created before the lease column existed
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let has_lease: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('sessions') WHERE name = 'claimed_until'",
        [],
        |row| row.get(0),
    )?;
    if has_lease == 0 {
        conn.execute("ALTER TABLE sessions ADD COLUMN claimed_until INTEGER", [])?;
        info!("Added claimed_until column to sessions");
    }
    Ok(())
}

fn insert(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let tokens = serde_json::to_string(&session.tokens)?;
    let sql = format!(
        "INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        COLUMNS
    );
    let result = conn.execute(
        &sql,
        params![
            session.id,
            session.owner_id,
            session.target_document_id,
            tokens,
            session.total_word_count as i64,
            session.cursor as i64,
            session.applied_word_count as i64,
            session.status.as_str(),
            session.tick_interval_ms,
            session.started_at,
            session.deadline_at,
            session.next_eligible_at,
            session.nap_until,
            session.last_error,
            session.created_at,
            session.updated_at,
            session.claimed_until,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(StoreError::Duplicate(session.id.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

fn query_sessions(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Session>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, SessionRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(SessionRow::into_session).collect()
}

fn claim(conn: &mut Connection, id: &str, now: i64, lease_until: i64) -> Result<Option<Session>, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let sql = format!(
        "UPDATE sessions SET next_eligible_at = ?3, claimed_until = ?3, updated_at = ?2
         WHERE id = ?1 AND status = 'running'
           AND next_eligible_at IS NOT NULL AND next_eligible_at <= ?2
           AND (claimed_until IS NULL OR claimed_until <= ?2)
         RETURNING {}",
        COLUMNS
    );
    let row = tx
        .query_row(&sql, params![id, now, lease_until], SessionRow::from_row)
        .optional()?;
    tx.commit()?;
    row.map(SessionRow::into_session).transpose()
}

/// Read, mutate in Rust, write back, all under one IMMEDIATE transaction
fn read_modify_write<F>(conn: &mut Connection, id: &str, apply: F) -> Result<Option<Session>, StoreError>
where
    F: FnOnce(&mut Session) -> bool,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let Some(mut session) = select_one(&tx, id)? else {
        return Ok(None);
    };
    if !apply(&mut session) {
        return Ok(None);
    }
    write_progress(&tx, &session)?;
    tx.commit()?;
    Ok(Some(session))
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        debug!(id = %session.id, "SqliteStore::create: called");
        let session = session.clone();
        self.with_conn(move |conn| insert(conn, &session)).await
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        debug!(%id, "SqliteStore::get: called");
        let id = id.to_string();
        self.with_conn(move |conn| select_one(conn, &id)).await
    }

    async fn list_due(&self, now: i64, limit: usize) -> Result<Vec<Session>, StoreError> {
        debug!(now, limit, "SqliteStore::list_due: called");
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM sessions
                 WHERE status = 'running' AND next_eligible_at IS NOT NULL AND next_eligible_at <= ?1
                   AND (claimed_until IS NULL OR claimed_until <= ?1)
                 ORDER BY next_eligible_at ASC, created_at ASC
                 LIMIT ?2",
                COLUMNS
            );
            query_sessions(conn, &sql, params![now, limit])
        })
        .await
    }

    async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<Session>, StoreError> {
        debug!(?status, "SqliteStore::list: called");
        self.with_conn(move |conn| match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM sessions WHERE status = ?1 ORDER BY created_at DESC",
                    COLUMNS
                );
                query_sessions(conn, &sql, params![status.as_str()])
            }
            None => {
                let sql = format!("SELECT {} FROM sessions ORDER BY created_at DESC", COLUMNS);
                query_sessions(conn, &sql, [])
            }
        })
        .await
    }

    async fn claim_due(&self, id: &str, now: i64, lease_until: i64) -> Result<Option<Session>, StoreError> {
        debug!(%id, now, lease_until, "SqliteStore::claim_due: called");
        let id = id.to_string();
        self.with_conn(move |conn| claim(conn, &id, now, lease_until)).await
    }

    async fn commit(&self, id: &str, commit: &ProgressCommit, now: i64) -> Result<Option<Session>, StoreError> {
        debug!(%id, "SqliteStore::commit: called");
        let id = id.to_string();
        let commit = commit.clone();
        self.with_conn(move |conn| read_modify_write(conn, &id, |session| session.apply_commit(&commit, now)))
            .await
    }

    async fn transition(
        &self,
        id: &str,
        transition: &StatusTransition,
        now: i64,
    ) -> Result<Option<Session>, StoreError> {
        debug!(%id, to = %transition.to, "SqliteStore::transition: called");
        let id = id.to_string();
        let transition = transition.clone();
        self.with_conn(move |conn| {
            read_modify_write(conn, &id, |session| session.apply_transition(&transition, now))
        })
        .await
    }

    async fn update(&self, session: &Session) -> Result<(), StoreError> {
        debug!(id = %session.id, "SqliteStore::update: called");
        let session = session.clone();
        self.with_conn(move |conn| match write_progress(conn, &session)? {
            0 => Err(StoreError::NotFound(session.id.clone())),
            _ => Ok(()),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn memory() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        contract::create_and_get(&memory()).await;
    }

    #[tokio::test]
    async fn test_list_due_orders_oldest_first() {
        contract::list_due_orders_oldest_first(&memory()).await;
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        contract::claim_is_exclusive(&memory()).await;
    }

    #[tokio::test]
    async fn test_claim_requires_running() {
        contract::claim_requires_running(&memory()).await;
    }

    #[tokio::test]
    async fn test_commit_writes_progress() {
        contract::commit_writes_progress(&memory()).await;
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        contract::transition_is_compare_and_set(&memory()).await;
    }

    #[tokio::test]
    async fn test_lease_survives_pause_and_resume() {
        contract::lease_survives_pause_and_resume(&memory()).await;
    }

    #[tokio::test]
    async fn test_lapsed_lease_can_be_reclaimed() {
        contract::lapsed_lease_can_be_reclaimed(&memory()).await;
    }

    #[tokio::test]
    async fn test_update_overwrites() {
        contract::update_overwrites(&memory()).await;
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        contract::list_filters_by_status(&memory()).await;
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("dw.db");

        let session = contract::session(1_000);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create(&session).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.tokens, session.tokens);
    }

    #[tokio::test]
    async fn test_adds_lease_column_to_older_databases() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dw.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(&SCHEMA.replace(",\n    claimed_until       INTEGER", "")).unwrap();
            let has_lease: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM pragma_table_info('sessions') WHERE name = 'claimed_until'",
                    [],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(has_lease, 0);
        }

        let store = SqliteStore::open(&path).unwrap();
        let session = contract::session(1_000);
        store.create(&session).await.unwrap();
        let claimed = store.claim_due(&session.id, 2_000, 62_000).await.unwrap().unwrap();
        assert_eq!(claimed.claimed_until, Some(62_000));

        // Reopening an up-to-date database is a no-op
        drop(store);
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(&session.id).await.unwrap().unwrap().claimed_until, Some(62_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_claim_exclusive_across_connections() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dw.db");

        let session = contract::session(1_000);
        SqliteStore::open(&path).unwrap().create(&session).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            let id = session.id.clone();
            handles.push(tokio::spawn(async move {
                store.claim_due(&id, 2_000, 62_000).await.unwrap().is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_corrupt_status_is_reported() {
        let store = memory();
        let session = contract::session(1_000);
        store.create(&session).await.unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE sessions SET status = 'exploded' WHERE id = ?1", params![session.id])
            .unwrap();

        assert!(matches!(store.get(&session.id).await, Err(StoreError::Corrupt { .. })));
    }
}
