//! Session store contract
//!
//! Durable CRUD over [`Session`] plus the conditional updates the claim
//! coordinator and the control surface rely on. `claim_due` is the only
//! operation that needs true atomicity across processes; `commit` and
//! `transition` are compare-and-set writes so concurrent writers never
//! clobber each other's fields.

mod memory;
mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ProgressCommit, Session, SessionStatus, StatusTransition};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session already exists: {0}")]
    Duplicate(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Corrupt record {id}: {detail}")]
    Corrupt { id: String, detail: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Durable session storage
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session
    async fn create(&self, session: &Session) -> Result<(), StoreError>;

    /// Read one session
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// RUNNING sessions due at `now`, oldest `next_eligible_at` first
    async fn list_due(&self, now: i64, limit: usize) -> Result<Vec<Session>, StoreError>;

    /// All sessions, newest first, optionally filtered by status
    async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<Session>, StoreError>;

    /// Atomically re-check that the session is RUNNING, due at `now` and not
    /// leased, and if so set both `next_eligible_at` and `claimed_until` to
    /// `lease_until`
    ///
    /// Returns the claimed record, or None when the condition no longer holds
    /// (another processor won, or the session changed). Only a commit releases
    /// the lease; status transitions leave it in place.
    async fn claim_due(&self, id: &str, now: i64, lease_until: i64) -> Result<Option<Session>, StoreError>;

    /// Single atomic write of a tick's result (see [`Session::apply_commit`])
    ///
    /// Returns None when the session is missing or the commit is stale.
    async fn commit(&self, id: &str, commit: &ProgressCommit, now: i64) -> Result<Option<Session>, StoreError>;

    /// Compare-and-set on status (see [`Session::apply_transition`])
    ///
    /// Returns None when the session is missing or its status did not match.
    async fn transition(
        &self,
        id: &str,
        transition: &StatusTransition,
        now: i64,
    ) -> Result<Option<Session>, StoreError>;

    /// Unconditional overwrite of an existing record
    async fn update(&self, session: &Session) -> Result<(), StoreError>;
}
