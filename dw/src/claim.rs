//! Claim coordination
//!
//! Guarantees at most one processor works a session's tick. A claim sets a
//! lease (`claimed_until`) one visibility timeout ahead and moves
//! `next_eligible_at` with it. Pause and resume reschedule the session but
//! leave the lease alone, so only the holder's commit or the lease lapsing
//! (the winner died mid-tick) makes the session claimable again.

use std::sync::Arc;

use tracing::debug;

use crate::domain::Session;
use crate::store::{SessionStore, StoreError};

/// Result of a claim attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This processor owns the tick; the record is the claimed snapshot
    Claimed(Session),
    /// The session was not due, or another processor got there first
    RaceLost,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed(_))
    }
}

/// Atomic claim on top of the session store
pub struct ClaimCoordinator {
    store: Arc<dyn SessionStore>,
    visibility_timeout_ms: i64,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn SessionStore>, visibility_timeout_ms: i64) -> Self {
        debug!(visibility_timeout_ms, "ClaimCoordinator::new: called");
        Self {
            store,
            visibility_timeout_ms,
        }
    }

    pub fn visibility_timeout_ms(&self) -> i64 {
        self.visibility_timeout_ms
    }

    /// Try to take the next tick of a session
    pub async fn claim(&self, session_id: &str, now: i64) -> Result<ClaimOutcome, StoreError> {
        debug!(%session_id, now, "ClaimCoordinator::claim: called");
        let lease_until = now + self.visibility_timeout_ms;
        match self.store.claim_due(session_id, now, lease_until).await? {
            Some(session) => {
                debug!(%session_id, lease_until, "ClaimCoordinator::claim: claimed");
                Ok(ClaimOutcome::Claimed(session))
            }
            None => {
                debug!(%session_id, "ClaimCoordinator::claim: race lost");
                Ok(ClaimOutcome::RaceLost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<dyn SessionStore>, Session) {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let session = Session::new("owner", "doc", "one two three", 1_000, 100_000, 5_000).unwrap();
        store.create(&session).await.unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn test_claim_sets_lease() {
        let (store, session) = setup().await;
        let claims = ClaimCoordinator::new(store.clone(), 60_000);

        let outcome = claims.claim(&session.id, 2_000).await.unwrap();
        assert!(outcome.is_claimed());

        let stored = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.next_eligible_at, Some(62_000));
    }

    #[tokio::test]
    async fn test_claim_not_due_is_race_lost() {
        let (store, session) = setup().await;
        let claims = ClaimCoordinator::new(store, 60_000);

        assert_eq!(claims.claim(&session.id, 500).await.unwrap(), ClaimOutcome::RaceLost);
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let (store, session) = setup().await;
        let claims = Arc::new(ClaimCoordinator::new(store, 60_000));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let claims = claims.clone();
            let id = session.id.clone();
            handles.push(tokio::spawn(async move { claims.claim(&id, 2_000).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_claimed() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_lapsed_lease_is_reclaimable() {
        let (store, session) = setup().await;
        let claims = ClaimCoordinator::new(store, 60_000);

        assert!(claims.claim(&session.id, 2_000).await.unwrap().is_claimed());
        assert!(!claims.claim(&session.id, 61_999).await.unwrap().is_claimed());
        assert!(claims.claim(&session.id, 62_000).await.unwrap().is_claimed());
    }
}
