//! In-memory session store
//!
//! Mutex-guarded map; every operation holds the lock for its whole
//! read-check-write, which gives the same atomicity as the SQLite store.
//! Used by tests and by single-process simulations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{SessionStore, StoreError};
use crate::domain::{ProgressCommit, Session, SessionStatus, StatusTransition};

#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Session>>, StoreError> {
        self.sessions.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        debug!(id = %session.id, "MemoryStore::create: called");
        let mut sessions = self.lock()?;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate(session.id.clone()));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        debug!(%id, "MemoryStore::get: called");
        Ok(self.lock()?.get(id).cloned())
    }

    async fn list_due(&self, now: i64, limit: usize) -> Result<Vec<Session>, StoreError> {
        debug!(now, limit, "MemoryStore::list_due: called");
        let sessions = self.lock()?;
        let mut due: Vec<Session> = sessions.values().filter(|s| s.is_due(now)).cloned().collect();
        due.sort_by_key(|s| (s.next_eligible_at, s.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<Session>, StoreError> {
        debug!(?status, "MemoryStore::list: called");
        let sessions = self.lock()?;
        let mut all: Vec<Session> = sessions
            .values()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        all.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(all)
    }

    async fn claim_due(&self, id: &str, now: i64, lease_until: i64) -> Result<Option<Session>, StoreError> {
        debug!(%id, now, lease_until, "MemoryStore::claim_due: called");
        let mut sessions = self.lock()?;
        match sessions.get_mut(id) {
            Some(session) => Ok(session.claim(now, lease_until).then(|| session.clone())),
            None => Ok(None),
        }
    }

    async fn commit(&self, id: &str, commit: &ProgressCommit, now: i64) -> Result<Option<Session>, StoreError> {
        debug!(%id, "MemoryStore::commit: called");
        let mut sessions = self.lock()?;
        match sessions.get_mut(id) {
            Some(session) => Ok(session.apply_commit(commit, now).then(|| session.clone())),
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        id: &str,
        transition: &StatusTransition,
        now: i64,
    ) -> Result<Option<Session>, StoreError> {
        debug!(%id, to = %transition.to, "MemoryStore::transition: called");
        let mut sessions = self.lock()?;
        match sessions.get_mut(id) {
            Some(session) => Ok(session.apply_transition(transition, now).then(|| session.clone())),
            None => Ok(None),
        }
    }

    async fn update(&self, session: &Session) -> Result<(), StoreError> {
        debug!(id = %session.id, "MemoryStore::update: called");
        let mut sessions = self.lock()?;
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(session.id.clone())),
        }
    }
}
