//! Control surface
//!
//! Start, pause, resume, cancel and status for callers (CLI, API layer).
//! Status changes are compare-and-set against the stored status, so a worker
//! commit landing at the same moment is never overwritten.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::domain::{Session, SessionStatus, StatusTransition, StatusView};
use crate::error::DripError;
use crate::pacing::PacingConfig;
use crate::scheduler::Scheduler;
use crate::store::SessionStore;
use crate::worker::{TickOutcome, Worker};

/// Longest session accepted by `start`
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

const CAS_ATTEMPTS: usize = 3;

/// Result of `repair`
#[derive(Debug, Clone, PartialEq)]
pub struct RepairReport {
    pub session: Session,
    pub previous_cursor: usize,
    pub previous_applied: usize,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        self.previous_cursor != self.session.cursor || self.previous_applied != self.session.applied_word_count
    }
}

/// Entry point for everything outside the worker
pub struct DripController {
    store: Arc<dyn SessionStore>,
    worker: Arc<Worker>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    pacing: PacingConfig,
}

impl DripController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        worker: Arc<Worker>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        pacing: PacingConfig,
    ) -> Self {
        debug!("DripController::new: called");
        Self {
            store,
            worker,
            scheduler,
            clock,
            pacing,
        }
    }

    /// Create a RUNNING session and kick its first tick; returns the session id
    pub async fn start(
        &self,
        owner_id: &str,
        target_document_id: &str,
        text: &str,
        duration_minutes: i64,
    ) -> Result<String, DripError> {
        debug!(%owner_id, %target_document_id, duration_minutes, "DripController::start: called");
        if owner_id.trim().is_empty() {
            return Err(DripError::Validation("Owner id is required".to_string()));
        }
        if target_document_id.trim().is_empty() {
            return Err(DripError::Validation("Target document id is required".to_string()));
        }
        if !(1..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
            return Err(DripError::Validation(format!(
                "Duration must be between 1 and {} minutes, got {}",
                MAX_DURATION_MINUTES, duration_minutes
            )));
        }

        let now = self.clock.now_ms();
        let duration_ms = duration_minutes * 60_000;
        let tick_interval_ms = self.pacing.tick_interval_for(duration_ms);
        let session = Session::new(
            owner_id,
            target_document_id,
            text,
            now,
            now + duration_ms,
            tick_interval_ms,
        )?;

        self.store.create(&session).await?;
        info!(
            id = %session.id,
            words = session.total_word_count,
            duration_minutes,
            tick_interval_ms,
            "Session started"
        );

        self.kick(&session.id, Duration::ZERO).await;
        Ok(session.id)
    }

    /// RUNNING → PAUSED; a no-op when already PAUSED
    pub async fn pause(&self, session_id: &str) -> Result<StatusView, DripError> {
        debug!(%session_id, "DripController::pause: called");
        let session = self
            .change_status(session_id, |session, _now| match session.status {
                SessionStatus::Paused => Ok(None),
                SessionStatus::Done | SessionStatus::Canceled => Err(DripError::Validation(format!(
                    "Session {} is already {}",
                    session.id, session.status
                ))),
                SessionStatus::Running => Ok(Some(StatusTransition {
                    from: vec![SessionStatus::Running],
                    to: SessionStatus::Paused,
                    next_eligible_at: None,
                    clear_error: false,
                })),
            })
            .await?;
        Ok(session.status_view())
    }

    /// PAUSED → RUNNING after a short delay; a no-op when already RUNNING
    ///
    /// Rejected once the deadline has passed or when the session is terminal.
    pub async fn resume(&self, session_id: &str) -> Result<StatusView, DripError> {
        debug!(%session_id, "DripController::resume: called");
        let resume_delay_ms = self.worker.config().resume_delay_ms;
        let session = self
            .change_status(session_id, |session, now| match session.status {
                SessionStatus::Running => Ok(None),
                SessionStatus::Done | SessionStatus::Canceled => Err(DripError::Validation(format!(
                    "Session {} is already {}",
                    session.id, session.status
                ))),
                SessionStatus::Paused if now >= session.deadline_at => Err(DripError::Validation(format!(
                    "Session {} is past its deadline and cannot be resumed",
                    session.id
                ))),
                SessionStatus::Paused => {
                    // A tick still in flight keeps its lease until it commits
                    let earliest = session
                        .claimed_until
                        .map_or(now + resume_delay_ms, |lease| lease.max(now + resume_delay_ms));
                    Ok(Some(StatusTransition {
                        from: vec![SessionStatus::Paused],
                        to: SessionStatus::Running,
                        next_eligible_at: Some(earliest.min(session.deadline_at)),
                        clear_error: true,
                    }))
                }
            })
            .await?;

        if let Some(next) = session.next_eligible_at {
            let delay = u64::try_from(next - self.clock.now_ms()).unwrap_or_default();
            self.kick(&session.id, Duration::from_millis(delay)).await;
        }
        Ok(session.status_view())
    }

    /// Any non-terminal status → CANCELED
    pub async fn cancel(&self, session_id: &str) -> Result<StatusView, DripError> {
        debug!(%session_id, "DripController::cancel: called");
        let session = self
            .change_status(session_id, |session, _now| {
                if session.is_terminal() {
                    return Err(DripError::Validation(format!(
                        "Session {} is already {}",
                        session.id, session.status
                    )));
                }
                Ok(Some(StatusTransition {
                    from: vec![SessionStatus::Running, SessionStatus::Paused],
                    to: SessionStatus::Canceled,
                    next_eligible_at: None,
                    clear_error: false,
                }))
            })
            .await?;
        Ok(session.status_view())
    }

    /// Committed state of a session
    pub async fn status(&self, session_id: &str) -> Result<StatusView, DripError> {
        debug!(%session_id, "DripController::status: called");
        Ok(self.load(session_id).await?.status_view())
    }

    /// Full stored record
    pub async fn inspect(&self, session_id: &str) -> Result<Session, DripError> {
        debug!(%session_id, "DripController::inspect: called");
        self.load(session_id).await
    }

    /// All sessions, newest first
    pub async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<StatusView>, DripError> {
        debug!(?status, "DripController::list: called");
        let sessions = self.store.list(status).await?;
        Ok(sessions.iter().map(Session::status_view).collect())
    }

    /// Process one due tick (a targeted session, or the oldest due one)
    pub async fn tick(&self, session_id: Option<&str>) -> Result<TickOutcome, DripError> {
        debug!(?session_id, "DripController::tick: called");
        Ok(self.worker.tick(session_id).await?)
    }

    /// Tick up to `batch` due sessions
    pub async fn sweep(&self, batch: usize) -> Result<Vec<TickOutcome>, DripError> {
        debug!(batch, "DripController::sweep: called");
        Ok(self.worker.sweep(batch).await?)
    }

    /// Recompute the cached word count from the cursor and clear the error
    ///
    /// Non-terminal sessions are left PAUSED so an operator resumes them
    /// explicitly; a repaired session that turns out complete becomes DONE.
    pub async fn repair(&self, session_id: &str) -> Result<RepairReport, DripError> {
        debug!(%session_id, "DripController::repair: called");
        let mut session = self.load(session_id).await?;
        let previous_cursor = session.cursor;
        let previous_applied = session.applied_word_count;

        session.cursor = session.cursor.min(session.tokens.len());
        session.applied_word_count = session.derived_word_count();
        session.last_error = None;
        session.nap_until = None;
        if !session.is_terminal() {
            session.status = if session.is_complete() {
                SessionStatus::Done
            } else {
                SessionStatus::Paused
            };
            session.next_eligible_at = None;
        }
        session.updated_at = self.clock.now_ms();

        self.store.update(&session).await?;
        info!(
            id = %session.id,
            previous_cursor,
            previous_applied,
            cursor = session.cursor,
            applied = session.applied_word_count,
            status = %session.status,
            "Session repaired"
        );
        Ok(RepairReport {
            session,
            previous_cursor,
            previous_applied,
        })
    }

    async fn load(&self, session_id: &str) -> Result<Session, DripError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| DripError::NotFound(session_id.to_string()))
    }

    /// Read, decide, compare-and-set; retried when the status moved underneath
    async fn change_status<F>(&self, session_id: &str, decide: F) -> Result<Session, DripError>
    where
        F: Fn(&Session, i64) -> Result<Option<StatusTransition>, DripError>,
    {
        for attempt in 1..=CAS_ATTEMPTS {
            let session = self.load(session_id).await?;
            let now = self.clock.now_ms();
            let Some(transition) = decide(&session, now)? else {
                debug!(%session_id, status = %session.status, "DripController::change_status: no-op");
                return Ok(session);
            };

            if let Some(saved) = self.store.transition(session_id, &transition, now).await? {
                info!(id = %session_id, from = %session.status, to = %saved.status, "Session status changed");
                return Ok(saved);
            }
            debug!(%session_id, attempt, "DripController::change_status: status moved, retrying");
        }
        Err(DripError::Conflict(session_id.to_string()))
    }

    async fn kick(&self, session_id: &str, delay: Duration) {
        if let Err(e) = self.scheduler.enqueue(session_id, delay).await {
            warn!(%session_id, error = %e, "Failed to kick session, sweep will pick it up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::clock::ManualClock;
    use crate::docs::MemoryAppender;
    use crate::scheduler::RecordingScheduler;
    use crate::store::MemoryStore;
    use crate::worker::WorkerConfig;

    const START: i64 = 1_700_000_000_000;

    struct Harness {
        store: Arc<MemoryStore>,
        scheduler: Arc<RecordingScheduler>,
        clock: Arc<ManualClock>,
        control: DripController,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(RecordingScheduler::new());
        let clock = Arc::new(ManualClock::new(START));
        let worker = Worker::new(
            store.clone(),
            Arc::new(MemoryAppender::new()),
            Arc::new(StaticTokenProvider::default()),
            clock.clone(),
            PacingConfig::default(),
            WorkerConfig::default(),
        )
        .with_seed(1);
        let control = DripController::new(
            store.clone(),
            Arc::new(worker),
            scheduler.clone(),
            clock.clone(),
            PacingConfig::default(),
        );
        Harness {
            store,
            scheduler,
            clock,
            control,
        }
    }

    #[tokio::test]
    async fn test_start_creates_running_session() {
        let h = harness();
        let id = h.control.start("owner", "doc", "hello there world", 60).await.unwrap();

        let view = h.control.status(&id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Running);
        assert_eq!(view.total_word_count, 3);
        assert_eq!(view.applied_word_count, 0);
        assert_eq!(view.next_eligible_at, Some(START));
        assert_eq!(view.deadline_at, START + 3_600_000);
        assert_eq!(h.scheduler.entries(), vec![(id.clone(), Duration::ZERO)]);

        let session = h.control.inspect(&id).await.unwrap();
        assert_eq!(session.tick_interval_ms, 80_000);
    }

    #[tokio::test]
    async fn test_short_session_gets_shorter_ticks() {
        let h = harness();
        let id = h.control.start("owner", "doc", "a b c", 1).await.unwrap();
        assert_eq!(h.control.inspect(&id).await.unwrap().tick_interval_ms, 7_500);
    }

    #[tokio::test]
    async fn test_start_validation() {
        let h = harness();
        for (owner, doc, text, minutes) in [
            ("", "doc", "words", 10),
            ("owner", " ", "words", 10),
            ("owner", "doc", "   \n\t", 10),
            ("owner", "doc", "words", 0),
            ("owner", "doc", "words", -5),
            ("owner", "doc", "words", MAX_DURATION_MINUTES + 1),
        ] {
            let err = h.control.start(owner, doc, text, minutes).await.unwrap_err();
            assert!(err.is_validation(), "{:?}", err);
        }
        assert!(h.store.list(None).await.unwrap().is_empty());
        assert!(h.scheduler.entries().is_empty());
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let h = harness();
        let id = h.control.start("owner", "doc", "a b c", 10).await.unwrap();

        let view = h.control.pause(&id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Paused);
        assert_eq!(view.next_eligible_at, None);

        let again = h.control.pause(&id).await.unwrap();
        assert_eq!(again, view);
    }

    #[tokio::test]
    async fn test_resume_schedules_after_delay() {
        let h = harness();
        let id = h.control.start("owner", "doc", "a b c", 10).await.unwrap();
        h.control.pause(&id).await.unwrap();

        let mut stored = h.store.get(&id).await.unwrap().unwrap();
        stored.last_error = Some("Authorization invalid".to_string());
        h.store.update(&stored).await.unwrap();

        h.clock.advance(1_000);
        let view = h.control.resume(&id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Running);
        assert_eq!(view.next_eligible_at, Some(START + 1_000 + 5_000));
        assert_eq!(view.last_error, None);
        assert_eq!(
            h.scheduler.entries().last(),
            Some(&(id.clone(), Duration::from_millis(5_000)))
        );

        // Resuming a running session changes nothing
        assert_eq!(h.control.resume(&id).await.unwrap(), view);
    }

    #[tokio::test]
    async fn test_resume_after_deadline_rejected() {
        let h = harness();
        let id = h.control.start("owner", "doc", "a b c", 1).await.unwrap();
        h.control.pause(&id).await.unwrap();

        h.clock.advance(60_000);
        let err = h.control.resume(&id).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(h.control.status(&id).await.unwrap().status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let h = harness();
        let id = h.control.start("owner", "doc", "a b c", 10).await.unwrap();

        let view = h.control.cancel(&id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Canceled);
        assert_eq!(view.next_eligible_at, None);

        assert!(h.control.cancel(&id).await.unwrap_err().is_validation());
        assert!(h.control.pause(&id).await.unwrap_err().is_validation());
        assert!(h.control.resume(&id).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness();
        assert!(matches!(h.control.status("drip-x").await, Err(DripError::NotFound(_))));
        assert!(matches!(h.control.pause("drip-x").await, Err(DripError::NotFound(_))));
        assert!(matches!(h.control.tick(Some("drip-x")).await, Err(DripError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_tick_through_control() {
        let h = harness();
        let id = h.control.start("owner", "doc", "a b c d", 10).await.unwrap();

        let outcome = h.control.tick(Some(&id)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Appended { .. }), "{:?}", outcome);
        assert!(h.control.status(&id).await.unwrap().applied_word_count >= 1);
    }

    #[tokio::test]
    async fn test_repair_recomputes_word_count() {
        let h = harness();
        let id = h.control.start("owner", "doc", "a b c d", 10).await.unwrap();

        let mut stored = h.store.get(&id).await.unwrap().unwrap();
        stored.cursor = 3;
        stored.applied_word_count = 7;
        stored.last_error = Some("invariant violation: drift".to_string());
        h.store.update(&stored).await.unwrap();

        let report = h.control.repair(&id).await.unwrap();
        assert!(report.changed());
        assert_eq!(report.previous_applied, 7);
        assert_eq!(report.session.applied_word_count, 2);
        assert_eq!(report.session.status, SessionStatus::Paused);
        assert_eq!(report.session.last_error, None);

        let view = h.control.status(&id).await.unwrap();
        assert_eq!(view.applied_word_count, 2);
        assert_eq!(view.next_eligible_at, None);
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let h = harness();
        let a = h.control.start("owner", "doc-a", "one", 10).await.unwrap();
        let b = h.control.start("owner", "doc-b", "two", 10).await.unwrap();
        h.control.cancel(&b).await.unwrap();

        assert_eq!(h.control.list(None).await.unwrap().len(), 2);
        let running = h.control.list(Some(SessionStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a);
    }
}
