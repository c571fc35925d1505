//! Worker loop: claim, plan, append, commit

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::config::WorkerConfig;
use super::failure::{Failure, FailureClass};
use crate::auth::TokenProvider;
use crate::claim::{ClaimCoordinator, ClaimOutcome};
use crate::clock::Clock;
use crate::docs::DocumentAppender;
use crate::domain::{ProgressCommit, Session, SessionStatus};
use crate::error::{InvariantViolation, truncate_error};
use crate::pacing::{Chunk, PacingConfig, PlanDecision, PlanInput, Planner};
use crate::scheduler::{NullScheduler, Scheduler};
use crate::store::{SessionStore, StoreError};

/// Errors that stop a tick
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing was due
    Idle,
    /// Targeted session is not RUNNING or not yet due
    NotDue { session_id: String },
    /// Another processor holds the tick
    RaceLost { session_id: String },
    /// A chunk was appended and committed
    Appended {
        session_id: String,
        words: usize,
        applied: usize,
        total: usize,
        next_eligible_at: Option<i64>,
    },
    /// The final words were committed; session is DONE
    Completed { session_id: String, words: usize },
    /// Planner chose to idle
    Napping { session_id: String, until: i64 },
    /// Ahead of schedule, nothing appended
    Waiting { session_id: String, next_eligible_at: i64 },
    /// Transient failure, backing off
    Retrying {
        session_id: String,
        error: String,
        next_eligible_at: i64,
    },
    /// Terminal failure, session PAUSED
    Paused { session_id: String, error: String },
    /// Commit rejected: the session advanced under a lapsed claim
    Stale { session_id: String },
    /// Invariant violation during a sweep; session PAUSED
    Halted { session_id: String, error: String },
}

impl TickOutcome {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::NotDue { session_id }
            | Self::RaceLost { session_id }
            | Self::Appended { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Napping { session_id, .. }
            | Self::Waiting { session_id, .. }
            | Self::Retrying { session_id, .. }
            | Self::Paused { session_id, .. }
            | Self::Stale { session_id }
            | Self::Halted { session_id, .. } => Some(session_id),
        }
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle: nothing due"),
            Self::NotDue { session_id } => write!(f, "{}: not due", session_id),
            Self::RaceLost { session_id } => write!(f, "{}: claimed elsewhere", session_id),
            Self::Appended {
                session_id,
                words,
                applied,
                total,
                ..
            } => write!(f, "{}: appended {} words ({}/{})", session_id, words, applied, total),
            Self::Completed { session_id, words } => {
                write!(f, "{}: appended {} words, done", session_id, words)
            }
            Self::Napping { session_id, until } => write!(f, "{}: napping until {}", session_id, until),
            Self::Waiting {
                session_id,
                next_eligible_at,
            } => write!(f, "{}: ahead of schedule, next at {}", session_id, next_eligible_at),
            Self::Retrying {
                session_id,
                error,
                next_eligible_at,
            } => write!(f, "{}: retry at {} ({})", session_id, next_eligible_at, error),
            Self::Paused { session_id, error } => write!(f, "{}: paused ({})", session_id, error),
            Self::Stale { session_id } => write!(f, "{}: stale commit dropped", session_id),
            Self::Halted { session_id, error } => write!(f, "{}: halted ({})", session_id, error),
        }
    }
}

/// Processes due ticks
pub struct Worker {
    store: Arc<dyn SessionStore>,
    claims: ClaimCoordinator,
    planner: Planner,
    appender: Arc<dyn DocumentAppender>,
    tokens: Arc<dyn TokenProvider>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    rng: Mutex<StdRng>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        appender: Arc<dyn DocumentAppender>,
        tokens: Arc<dyn TokenProvider>,
        clock: Arc<dyn Clock>,
        pacing: PacingConfig,
        config: WorkerConfig,
    ) -> Self {
        debug!(?config, "Worker::new: called");
        Self {
            claims: ClaimCoordinator::new(store.clone(), config.visibility_timeout_ms),
            store,
            planner: Planner::new(pacing),
            appender,
            tokens,
            scheduler: Arc::new(NullScheduler),
            clock,
            config,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Builder method to deliver next-tick kicks through a scheduler
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Builder method for a reproducible random source
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Process one tick
    ///
    /// With an id, only that session is considered and it must be due. Without
    /// one, the oldest due session is picked.
    pub async fn tick(&self, session_id: Option<&str>) -> Result<TickOutcome, WorkerError> {
        debug!(?session_id, "Worker::tick: called");
        let now = self.clock.now_ms();

        match session_id {
            Some(id) => {
                let session = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| WorkerError::NotFound(id.to_string()))?;
                if !session.is_due(now) {
                    debug!(%id, status = %session.status, next = ?session.next_eligible_at, "Worker::tick: not due");
                    return Ok(TickOutcome::NotDue {
                        session_id: id.to_string(),
                    });
                }
                self.process(id).await
            }
            None => match self.store.list_due(now, 1).await?.first() {
                Some(session) => self.process(&session.id).await,
                None => {
                    debug!("Worker::tick: nothing due");
                    Ok(TickOutcome::Idle)
                }
            },
        }
    }

    /// Tick up to `batch` due sessions, oldest first
    ///
    /// Invariant violations halt only the offending session and are reported
    /// as [`TickOutcome::Halted`]; store errors abort the sweep.
    pub async fn sweep(&self, batch: usize) -> Result<Vec<TickOutcome>, WorkerError> {
        debug!(batch, "Worker::sweep: called");
        let due = self.due(batch).await?;
        let mut outcomes = Vec::with_capacity(due.len());

        for session_id in due {
            match self.process(&session_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(WorkerError::Invariant(violation)) => outcomes.push(TickOutcome::Halted {
                    session_id,
                    error: violation.to_string(),
                }),
                Err(e) => return Err(e),
            }
        }

        debug!(count = outcomes.len(), "Worker::sweep: complete");
        Ok(outcomes)
    }

    /// Ids of due sessions, oldest first
    pub async fn due(&self, limit: usize) -> Result<Vec<String>, WorkerError> {
        let now = self.clock.now_ms();
        let due = self.store.list_due(now, limit).await?;
        Ok(due.into_iter().map(|s| s.id).collect())
    }

    async fn process(&self, session_id: &str) -> Result<TickOutcome, WorkerError> {
        let now = self.clock.now_ms();
        let session = match self.claims.claim(session_id, now).await? {
            ClaimOutcome::Claimed(session) => session,
            ClaimOutcome::RaceLost => {
                debug!(%session_id, "Worker::process: race lost");
                return Ok(TickOutcome::RaceLost {
                    session_id: session_id.to_string(),
                });
            }
        };

        if session.is_complete() {
            info!(%session_id, "Session already complete, marking done");
            let commit = ProgressCommit {
                status: SessionStatus::Done,
                ..ProgressCommit::unchanged(&session)
            };
            return Ok(match self.commit(&session, commit, now).await? {
                Some(_) => TickOutcome::Completed {
                    session_id: session.id,
                    words: 0,
                },
                None => TickOutcome::Stale { session_id: session.id },
            });
        }

        let decision = {
            let input = PlanInput::from_session(&session, now);
            let mut rng = self.rng();
            self.planner.plan(&input, &mut *rng)
        };

        match decision {
            Ok(PlanDecision::Emit(chunk)) => self.emit(&session, chunk).await,
            Ok(PlanDecision::Nap { until }) => self.nap(&session, until, now).await,
            Ok(PlanDecision::Noop) => self.wait(&session, now).await,
            Err(violation) => self.halt(&session, violation, now).await,
        }
    }

    async fn emit(&self, session: &Session, chunk: Chunk) -> Result<TickOutcome, WorkerError> {
        debug!(id = %session.id, words = chunk.added_words, "Worker::emit: called");
        let token = match self.tokens.get_valid_access_token(&session.owner_id).await {
            Ok(token) => token,
            Err(e) => return self.fail(session, Failure::from(e)).await,
        };
        if let Err(e) = self
            .appender
            .append(&token, &session.target_document_id, &chunk.text)
            .await
        {
            return self.fail(session, Failure::from(e)).await;
        }

        let now = self.clock.now_ms();
        let applied = session.applied_word_count + chunk.added_words;
        let done = applied >= session.total_word_count;
        let commit = ProgressCommit {
            expected_cursor: session.cursor,
            cursor: chunk.new_cursor,
            applied_word_count: applied,
            status: if done { SessionStatus::Done } else { SessionStatus::Running },
            next_eligible_at: if done { None } else { Some(self.next_tick_at(session, now)) },
            nap_until: None,
            last_error: None,
        };

        let Some(saved) = self.commit(session, commit, now).await? else {
            warn!(id = %session.id, words = chunk.added_words, "Chunk appended but commit was stale");
            return Ok(TickOutcome::Stale {
                session_id: session.id.clone(),
            });
        };

        if saved.status == SessionStatus::Done {
            info!(id = %saved.id, total = saved.total_word_count, "Session complete");
            return Ok(TickOutcome::Completed {
                session_id: saved.id,
                words: chunk.added_words,
            });
        }

        info!(
            id = %saved.id,
            words = chunk.added_words,
            applied = saved.applied_word_count,
            total = saved.total_word_count,
            "Appended chunk"
        );
        Ok(TickOutcome::Appended {
            words: chunk.added_words,
            applied: saved.applied_word_count,
            total: saved.total_word_count,
            next_eligible_at: saved.next_eligible_at,
            session_id: saved.id,
        })
    }

    async fn nap(&self, session: &Session, until: i64, now: i64) -> Result<TickOutcome, WorkerError> {
        debug!(id = %session.id, until, "Worker::nap: called");
        let commit = ProgressCommit {
            next_eligible_at: Some(until),
            nap_until: Some(until),
            last_error: session.last_error.clone(),
            ..ProgressCommit::unchanged(session)
        };
        Ok(match self.commit(session, commit, now).await? {
            Some(_) => TickOutcome::Napping {
                session_id: session.id.clone(),
                until,
            },
            None => TickOutcome::Stale {
                session_id: session.id.clone(),
            },
        })
    }

    async fn wait(&self, session: &Session, now: i64) -> Result<TickOutcome, WorkerError> {
        debug!(id = %session.id, "Worker::wait: called");
        let next = self.next_tick_at(session, now);
        let commit = ProgressCommit {
            next_eligible_at: Some(next),
            nap_until: session.nap_until,
            last_error: session.last_error.clone(),
            ..ProgressCommit::unchanged(session)
        };
        Ok(match self.commit(session, commit, now).await? {
            Some(_) => TickOutcome::Waiting {
                session_id: session.id.clone(),
                next_eligible_at: next,
            },
            None => TickOutcome::Stale {
                session_id: session.id.clone(),
            },
        })
    }

    async fn fail(&self, session: &Session, failure: Failure) -> Result<TickOutcome, WorkerError> {
        let now = self.clock.now_ms();
        let message = truncate_error(&failure.message, self.config.max_error_len);

        match failure.class {
            FailureClass::Transient => {
                let next = self.backoff_at(session, now);
                warn!(id = %session.id, error = %message, next, "Transient failure, backing off");
                let commit = ProgressCommit {
                    next_eligible_at: Some(next),
                    nap_until: session.nap_until,
                    last_error: Some(message.clone()),
                    ..ProgressCommit::unchanged(session)
                };
                Ok(match self.commit(session, commit, now).await? {
                    Some(_) => TickOutcome::Retrying {
                        session_id: session.id.clone(),
                        error: message,
                        next_eligible_at: next,
                    },
                    None => TickOutcome::Stale {
                        session_id: session.id.clone(),
                    },
                })
            }
            FailureClass::Terminal => {
                error!(id = %session.id, error = %message, "Terminal failure, pausing session");
                let commit = ProgressCommit {
                    status: SessionStatus::Paused,
                    last_error: Some(message.clone()),
                    ..ProgressCommit::unchanged(session)
                };
                Ok(match self.commit(session, commit, now).await? {
                    Some(_) => TickOutcome::Paused {
                        session_id: session.id.clone(),
                        error: message,
                    },
                    None => TickOutcome::Stale {
                        session_id: session.id.clone(),
                    },
                })
            }
        }
    }

    /// Stop ticking a session whose accounting is broken
    async fn halt(
        &self,
        session: &Session,
        violation: InvariantViolation,
        now: i64,
    ) -> Result<TickOutcome, WorkerError> {
        error!(id = %session.id, %violation, "Invariant violation, halting session");
        let message = truncate_error(
            &format!("invariant violation: {}", violation.detail),
            self.config.max_error_len,
        );
        let commit = ProgressCommit {
            status: SessionStatus::Paused,
            last_error: Some(message),
            ..ProgressCommit::unchanged(session)
        };
        self.store.commit(&session.id, &commit, now).await?;
        Err(WorkerError::Invariant(violation))
    }

    /// Write a commit and kick the next tick if one is scheduled
    async fn commit(&self, session: &Session, commit: ProgressCommit, now: i64) -> Result<Option<Session>, WorkerError> {
        let saved = self.store.commit(&session.id, &commit, now).await?;
        match &saved {
            Some(saved) => self.reschedule(saved, now).await,
            None => warn!(id = %session.id, expected = commit.expected_cursor, "Commit rejected, session advanced elsewhere"),
        }
        Ok(saved)
    }

    async fn reschedule(&self, saved: &Session, now: i64) {
        if saved.status != SessionStatus::Running {
            return;
        }
        if let Some(next) = saved.next_eligible_at {
            let delay = Duration::from_millis(u64::try_from(next - now).unwrap_or_default());
            if let Err(e) = self.scheduler.enqueue(&saved.id, delay).await {
                warn!(id = %saved.id, error = %e, "Failed to schedule next tick, sweep will pick it up");
            }
        }
    }

    /// Humanized next tick: a random multiple of the session tick interval
    fn next_tick_at(&self, session: &Session, now: i64) -> i64 {
        let (lo, hi) = self.config.tick_delay_factor;
        let factor: f64 = self.rng().random_range(lo..=hi);
        let delay = (session.tick_interval_ms as f64 * factor).round() as i64;
        clamp_to_deadline(session, now, now + delay.max(1))
    }

    fn backoff_at(&self, session: &Session, now: i64) -> i64 {
        let (lo, hi) = self.config.backoff_ms;
        let delay: i64 = self.rng().random_range(lo..=hi);
        clamp_to_deadline(session, now, now + delay.max(1))
    }
}

/// Never schedule past the deadline while it is still ahead
fn clamp_to_deadline(session: &Session, now: i64, at: i64) -> i64 {
    if now < session.deadline_at {
        at.min(session.deadline_at)
    } else {
        at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::auth::{StaticTokenProvider, TokenError};
    use crate::clock::ManualClock;
    use crate::control::DripController;
    use crate::docs::{AppendError, MemoryAppender};
    use crate::scheduler::RecordingScheduler;
    use crate::store::MemoryStore;

    const TEXT: &str = "a b c d e f g h i j";
    const START: i64 = 1_700_000_000_000;

    struct Harness {
        store: Arc<MemoryStore>,
        appender: Arc<MemoryAppender>,
        tokens: Arc<StaticTokenProvider>,
        scheduler: Arc<RecordingScheduler>,
        clock: Arc<ManualClock>,
        worker: Worker,
    }

    fn harness(pacing: PacingConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let appender = Arc::new(MemoryAppender::new());
        let tokens = Arc::new(StaticTokenProvider::default());
        let scheduler = Arc::new(RecordingScheduler::new());
        let clock = Arc::new(ManualClock::new(START));
        let worker = Worker::new(
            store.clone(),
            appender.clone(),
            tokens.clone(),
            clock.clone(),
            pacing,
            WorkerConfig::default(),
        )
        .with_scheduler(scheduler.clone())
        .with_seed(7);
        Harness {
            store,
            appender,
            tokens,
            scheduler,
            clock,
            worker,
        }
    }

    /// 10 words, 2s ticks, 8 ticks long
    async fn start(h: &Harness) -> Session {
        let session = Session::new("owner", "doc", TEXT, START, START + 16_000, 2_000).unwrap();
        h.store.create(&session).await.unwrap();
        session
    }

    async fn load(h: &Harness, id: &str) -> Session {
        h.store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_first_tick_is_visible() {
        let h = harness(PacingConfig::default());
        let session = start(&h).await;

        let outcome = h.worker.tick(None).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Appended { .. }), "{:?}", outcome);

        let stored = load(&h, &session.id).await;
        assert!((1..=3).contains(&stored.applied_word_count));
        assert_eq!(h.appender.document("doc"), stored.applied_text());
        assert!(stored.next_eligible_at.unwrap() > START);
        assert_eq!(h.scheduler.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_and_not_due() {
        let h = harness(PacingConfig::default());
        assert_eq!(h.worker.tick(None).await.unwrap(), TickOutcome::Idle);

        let session = start(&h).await;
        h.clock.set(START - 1);
        assert_eq!(
            h.worker.tick(Some(&session.id)).await.unwrap(),
            TickOutcome::NotDue {
                session_id: session.id.clone()
            }
        );
        assert_eq!(load(&h, &session.id).await, session);
        assert_eq!(h.appender.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let h = harness(PacingConfig::default());
        assert!(matches!(
            h.worker.tick(Some("drip-nope")).await,
            Err(WorkerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_to_completion_by_deadline() {
        let h = harness(PacingConfig::default());
        let session = start(&h).await;

        for _ in 0..100 {
            let stored = load(&h, &session.id).await;
            if stored.status == SessionStatus::Done {
                break;
            }
            h.clock.set(stored.next_eligible_at.unwrap());
            h.worker.tick(Some(&session.id)).await.unwrap();
        }

        let stored = load(&h, &session.id).await;
        assert_eq!(stored.status, SessionStatus::Done);
        assert_eq!(stored.applied_word_count, 10);
        assert_eq!(stored.next_eligible_at, None);
        assert!(h.clock.now_ms() <= session.deadline_at);
        assert_eq!(h.appender.document("doc"), TEXT);
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off() {
        let h = harness(PacingConfig::default().without_naps());
        let session = start(&h).await;
        for _ in 0..2 {
            let stored = load(&h, &session.id).await;
            h.clock.set(stored.next_eligible_at.unwrap());
            let outcome = h.worker.tick(Some(&session.id)).await.unwrap();
            assert!(matches!(outcome, TickOutcome::Appended { .. }), "{:?}", outcome);
        }
        let before = load(&h, &session.id).await;

        h.clock.set(before.next_eligible_at.unwrap());
        h.appender.fail_next(AppendError::Transient("503 backend error".into()));
        let outcome = h.worker.tick(Some(&session.id)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Retrying { .. }), "{:?}", outcome);

        let after = load(&h, &session.id).await;
        assert_eq!(after.status, SessionStatus::Running);
        assert_eq!(after.cursor, before.cursor);
        assert_eq!(after.applied_word_count, before.applied_word_count);
        assert!(after.next_eligible_at.unwrap() > h.clock.now_ms());
        assert!(after.next_eligible_at.unwrap() <= session.deadline_at);
        assert!(after.last_error.unwrap().contains("503"));
        assert_eq!(after.claimed_until, None);
        assert_eq!(h.appender.document("doc"), before.applied_text());
    }

    #[tokio::test]
    async fn test_auth_invalid_pauses() {
        let h = harness(PacingConfig::default());
        let session = start(&h).await;
        h.tokens.fail_next(TokenError::AuthInvalid("invalid_grant".into()));

        let outcome = h.worker.tick(None).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Paused { .. }), "{:?}", outcome);

        let stored = load(&h, &session.id).await;
        assert_eq!(stored.status, SessionStatus::Paused);
        assert_eq!(stored.next_eligible_at, None);
        assert_eq!(stored.applied_word_count, 0);
        assert_eq!(h.appender.calls(), 0);

        // No further ticks fire
        h.clock.advance(60_000);
        assert_eq!(h.worker.tick(None).await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_permanent_append_error_pauses() {
        let h = harness(PacingConfig::default());
        let session = start(&h).await;
        h.appender.fail_next(AppendError::Permanent("document deleted".into()));

        let outcome = h.worker.tick(None).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Paused { .. }));
        let stored = load(&h, &session.id).await;
        assert_eq!(stored.status, SessionStatus::Paused);
        assert!(stored.last_error.unwrap().contains("document deleted"));
    }

    #[tokio::test]
    async fn test_error_message_is_truncated() {
        let h = harness(PacingConfig::default());
        let session = start(&h).await;
        h.appender.fail_next(AppendError::Transient("x".repeat(5_000)));

        h.worker.tick(None).await.unwrap();
        let stored = load(&h, &session.id).await;
        assert_eq!(stored.last_error.unwrap().chars().count(), 1_500);
    }

    #[tokio::test]
    async fn test_complete_session_marked_done() {
        let h = harness(PacingConfig::default());
        let mut session = Session::new("owner", "doc", "one two", START, START + 10_000, 2_000).unwrap();
        session.cursor = session.tokens.len();
        session.applied_word_count = 2;
        h.store.create(&session).await.unwrap();

        let outcome = h.worker.tick(None).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Completed {
                session_id: session.id.clone(),
                words: 0
            }
        );
        assert_eq!(load(&h, &session.id).await.status, SessionStatus::Done);
        assert_eq!(h.appender.calls(), 0);
    }

    #[tokio::test]
    async fn test_invariant_violation_halts_session() {
        let h = harness(PacingConfig::default());
        let mut session = Session::new("owner", "doc", TEXT, START, START + 16_000, 2_000).unwrap();
        session.cursor = 4;
        session.applied_word_count = 5;
        h.store.create(&session).await.unwrap();

        let err = h.worker.tick(Some(&session.id)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Invariant(_)));

        let stored = load(&h, &session.id).await;
        assert_eq!(stored.status, SessionStatus::Paused);
        assert_eq!(stored.applied_word_count, 5);
        assert!(stored.last_error.unwrap().starts_with("invariant violation:"));
        assert_eq!(h.appender.calls(), 0);
    }

    #[tokio::test]
    async fn test_active_nap_is_committed() {
        let h = harness(PacingConfig::default());
        let session = start(&h).await;
        h.worker.tick(None).await.unwrap();

        let mut stored = load(&h, &session.id).await;
        let until = START + 6_000;
        stored.nap_until = Some(until);
        stored.next_eligible_at = Some(START + 1_000);
        h.store.update(&stored).await.unwrap();

        h.clock.set(START + 1_000);
        let outcome = h.worker.tick(Some(&session.id)).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Napping {
                session_id: session.id.clone(),
                until
            }
        );
        let stored = load(&h, &session.id).await;
        assert_eq!(stored.next_eligible_at, Some(until));
        assert_eq!(stored.nap_until, Some(until));
    }

    #[tokio::test]
    async fn test_scheduler_failure_is_ignored() {
        let h = harness(PacingConfig::default());
        let session = start(&h).await;
        h.scheduler.set_failing(true);

        let outcome = h.worker.tick(None).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Appended { .. }));
        assert!(load(&h, &session.id).await.next_eligible_at.is_some());
    }

    #[tokio::test]
    async fn test_sweep_ticks_due_sessions() {
        let h = harness(PacingConfig::default().without_naps());
        let first = start(&h).await;
        let second = Session::new("owner", "doc-2", "x y z", START, START + 16_000, 2_000).unwrap();
        h.store.create(&second).await.unwrap();
        let mut paused = Session::new("owner", "doc-3", "p q", START, START + 16_000, 2_000).unwrap();
        paused.status = SessionStatus::Paused;
        paused.next_eligible_at = None;
        h.store.create(&paused).await.unwrap();

        let outcomes = h.worker.sweep(10).await.unwrap();
        let ids: Vec<&str> = outcomes.iter().filter_map(|o| o.session_id()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id.as_str()));
        assert!(ids.contains(&second.id.as_str()));

        // Everything was pushed into the future
        assert!(h.worker.sweep(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_reports_halted_sessions() {
        let h = harness(PacingConfig::default());
        let mut broken = Session::new("owner", "doc", TEXT, START, START + 16_000, 2_000).unwrap();
        broken.applied_word_count = 3;
        h.store.create(&broken).await.unwrap();

        let outcomes = h.worker.sweep(10).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], TickOutcome::Halted { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_ticks_append_once() {
        let h = harness(PacingConfig::default());
        let session = start(&h).await;
        let worker = Arc::new(h.worker);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let worker = worker.clone();
            let id = session.id.clone();
            handles.push(tokio::spawn(async move { worker.tick(Some(&id)).await.unwrap() }));
        }

        let mut appended = 0;
        for handle in handles {
            match handle.await.unwrap() {
                TickOutcome::Appended { .. } => appended += 1,
                TickOutcome::RaceLost { .. } | TickOutcome::NotDue { .. } => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(appended, 1);
        assert_eq!(h.appender.calls(), 1);
    }

    // =========================================================================
    // Ticks overlapping a lease lapse or a status change
    // =========================================================================

    /// Holds the next append until released
    #[derive(Default)]
    struct GatedAppender {
        inner: MemoryAppender,
        held: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedAppender {
        fn hold_next(&self) {
            self.held.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DocumentAppender for GatedAppender {
        async fn append(&self, access_token: &str, target_document_id: &str, text: &str) -> Result<(), AppendError> {
            if self.held.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.append(access_token, target_document_id, text).await
        }
    }

    struct Overlap {
        store: Arc<MemoryStore>,
        appender: Arc<GatedAppender>,
        clock: Arc<ManualClock>,
        first: Arc<Worker>,
        second: Arc<Worker>,
        control: DripController,
        session: Session,
    }

    /// Two workers over one store; 10 words over ten minutes
    async fn overlap() -> Overlap {
        let store = Arc::new(MemoryStore::new());
        let appender = Arc::new(GatedAppender::default());
        let clock = Arc::new(ManualClock::new(START));
        let scheduler = Arc::new(RecordingScheduler::new());
        let worker = |seed| {
            Arc::new(
                Worker::new(
                    store.clone(),
                    appender.clone(),
                    Arc::new(StaticTokenProvider::default()),
                    clock.clone(),
                    PacingConfig::default().without_naps(),
                    WorkerConfig::default(),
                )
                .with_scheduler(scheduler.clone())
                .with_seed(seed),
            )
        };
        let first = worker(1);
        let second = worker(2);
        let control = DripController::new(
            store.clone(),
            first.clone(),
            scheduler.clone(),
            clock.clone(),
            PacingConfig::default().without_naps(),
        );

        let session = Session::new("owner", "doc", TEXT, START, START + 600_000, 75_000).unwrap();
        store.create(&session).await.unwrap();
        Overlap {
            store,
            appender,
            clock,
            first,
            second,
            control,
            session,
        }
    }

    impl Overlap {
        /// Start a tick on the first worker and wait until its append is in flight
        async fn hold_first_tick(&self) -> tokio::task::JoinHandle<TickOutcome> {
            self.appender.hold_next();
            let worker = self.first.clone();
            let id = self.session.id.clone();
            let handle = tokio::spawn(async move { worker.tick(Some(&id)).await.unwrap() });
            self.appender.entered.notified().await;
            handle
        }

        async fn load(&self) -> Session {
            self.store.get(&self.session.id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_lapsed_lease_commit_is_stale() {
        let o = overlap().await;
        let held = o.hold_first_tick().await;
        assert_eq!(o.load().await.claimed_until, Some(START + 60_000));

        // Lease lapses; the second worker takes over the same cursor
        o.clock.advance(60_000);
        let outcome = o.second.tick(Some(&o.session.id)).await.unwrap();
        let applied = match outcome {
            TickOutcome::Appended { applied, .. } => applied,
            other => panic!("second worker should append, got {:?}", other),
        };
        let after_second = o.load().await;
        assert_eq!(after_second.applied_word_count, applied);
        assert_eq!(after_second.claimed_until, None);

        o.appender.release.notify_one();
        let outcome = held.await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Stale {
                session_id: o.session.id.clone()
            }
        );

        // The cursor moved once
        let stored = o.load().await;
        assert_eq!(stored.cursor, after_second.cursor);
        assert_eq!(stored.applied_word_count, applied);
        assert_eq!(stored.next_eligible_at, after_second.next_eligible_at);
        assert_eq!(o.appender.inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_pause_during_append_keeps_progress() {
        let o = overlap().await;
        let held = o.hold_first_tick().await;

        let view = o.control.pause(&o.session.id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Paused);

        o.appender.release.notify_one();
        held.await.unwrap();

        let stored = o.load().await;
        assert_eq!(stored.status, SessionStatus::Paused);
        assert!(stored.applied_word_count > 0);
        assert_eq!(stored.next_eligible_at, None);
        assert_eq!(stored.claimed_until, None);
        assert_eq!(o.appender.inner.document("doc"), stored.applied_text());
    }

    #[tokio::test]
    async fn test_cancel_during_append_keeps_progress() {
        let o = overlap().await;
        let held = o.hold_first_tick().await;

        o.control.cancel(&o.session.id).await.unwrap();

        o.appender.release.notify_one();
        held.await.unwrap();

        let stored = o.load().await;
        assert_eq!(stored.status, SessionStatus::Canceled);
        assert!(stored.applied_word_count > 0);
        assert_eq!(stored.next_eligible_at, None);
        assert_eq!(stored.claimed_until, None);
        assert_eq!(o.appender.inner.document("doc"), stored.applied_text());

        o.clock.advance(600_000);
        assert_eq!(o.second.tick(None).await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_resume_during_append_does_not_duplicate() {
        let o = overlap().await;
        let held = o.hold_first_tick().await;

        o.control.pause(&o.session.id).await.unwrap();
        let view = o.control.resume(&o.session.id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Running);
        assert!(view.next_eligible_at.unwrap() >= START + 60_000);

        // Past the resume delay, the first owner's lease still holds
        o.clock.advance(o.first.config().resume_delay_ms);
        assert_eq!(
            o.second.tick(Some(&o.session.id)).await.unwrap(),
            TickOutcome::NotDue {
                session_id: o.session.id.clone()
            }
        );
        assert_eq!(o.second.tick(None).await.unwrap(), TickOutcome::Idle);
        assert_eq!(o.appender.inner.calls(), 0);

        o.appender.release.notify_one();
        let outcome = held.await.unwrap();
        assert!(matches!(outcome, TickOutcome::Appended { .. }), "{:?}", outcome);

        let stored = o.load().await;
        assert_eq!(stored.status, SessionStatus::Running);
        assert_eq!(stored.claimed_until, None);
        assert_eq!(o.appender.inner.calls(), 1);
        assert_eq!(o.appender.inner.document("doc"), stored.applied_text());
    }
}
