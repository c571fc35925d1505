//! Session domain type
//!
//! A session is the only stateful entity: the token stream being released
//! into one target document, the progress cursor, and the scheduling fields
//! the worker and claim coordinator operate on.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::id::generate_id;
use super::token::{Token, count_words, join, tokenize, words_before};
use crate::error::DripError;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Scheduled and ticking
    #[default]
    Running,
    /// Stopped by the user or by a terminal failure; resumable
    Paused,
    /// All words applied
    Done,
    /// Stopped for good
    Canceled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Canceled => "canceled",
        }
    }

    /// DONE and CANCELED never tick again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "done" => Ok(Self::Done),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("Unknown session status: {}", other)),
        }
    }
}

/// A paced release of one text into one external document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: String,

    /// Opaque owner reference (used to fetch credentials)
    pub owner_id: String,

    /// Opaque reference to the document being appended to
    pub target_document_id: String,

    /// Immutable token stream derived from the source text
    pub tokens: Vec<Token>,

    /// Number of word tokens in `tokens`
    pub total_word_count: usize,

    /// Index into `tokens`: everything before it has been applied
    pub cursor: usize,

    /// Word tokens before `cursor` (cached)
    pub applied_word_count: usize,

    pub status: SessionStatus,

    /// Nominal spacing between ticks, used by the pacing planner
    pub tick_interval_ms: i64,

    /// Pacing window start (Unix milliseconds)
    pub started_at: i64,

    /// Pacing window end (Unix milliseconds)
    pub deadline_at: i64,

    /// When the session next becomes claimable; None when unscheduled
    pub next_eligible_at: Option<i64>,

    /// Planner-set idle window
    pub nap_until: Option<i64>,

    /// Lease held by the processor working the current tick; cleared by its commit
    #[serde(default)]
    pub claimed_until: Option<i64>,

    /// Last failure summary (if any)
    pub last_error: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Session {
    /// Create a RUNNING session that is immediately eligible
    pub fn new(
        owner_id: impl Into<String>,
        target_document_id: impl Into<String>,
        text: &str,
        started_at: i64,
        deadline_at: i64,
        tick_interval_ms: i64,
    ) -> Result<Self, DripError> {
        debug!(started_at, deadline_at, tick_interval_ms, "Session::new: called");
        if deadline_at <= started_at {
            return Err(DripError::Validation("Deadline must be after start".to_string()));
        }
        if tick_interval_ms <= 0 {
            return Err(DripError::Validation("Tick interval must be positive".to_string()));
        }

        let tokens = tokenize(text);
        let total_word_count = count_words(&tokens);
        if total_word_count == 0 {
            return Err(DripError::Validation("No words to drip".to_string()));
        }

        Ok(Self {
            id: generate_id("drip"),
            owner_id: owner_id.into(),
            target_document_id: target_document_id.into(),
            tokens,
            total_word_count,
            cursor: 0,
            applied_word_count: 0,
            status: SessionStatus::Running,
            tick_interval_ms,
            started_at,
            deadline_at,
            next_eligible_at: Some(started_at),
            nap_until: None,
            claimed_until: None,
            last_error: None,
            created_at: started_at,
            updated_at: started_at,
        })
    }

    /// Builder method to pin the ID (tests and imports)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// RUNNING, scheduled at or before `now`, and not leased to another processor
    pub fn is_due(&self, now: i64) -> bool {
        self.status == SessionStatus::Running
            && self.next_eligible_at.is_some_and(|t| t <= now)
            && self.claimed_until.is_none_or(|t| t <= now)
    }

    /// Take the lease on a due session; returns false when it is not due
    ///
    /// The lease is kept apart from `next_eligible_at`: pause and resume
    /// rewrite the schedule but never the lease.
    pub fn claim(&mut self, now: i64, lease_until: i64) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.next_eligible_at = Some(lease_until);
        self.claimed_until = Some(lease_until);
        self.updated_at = now;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.applied_word_count >= self.total_word_count
    }

    pub fn remaining_words(&self) -> usize {
        self.total_word_count.saturating_sub(self.applied_word_count)
    }

    /// Text applied so far
    pub fn applied_text(&self) -> String {
        join(&self.tokens[..self.cursor.min(self.tokens.len())])
    }

    /// Word count derived from the cursor (authoritative)
    pub fn derived_word_count(&self) -> usize {
        words_before(&self.tokens, self.cursor)
    }

    /// Committed state as shown to callers
    pub fn status_view(&self) -> StatusView {
        StatusView {
            id: self.id.clone(),
            status: self.status,
            applied_word_count: self.applied_word_count,
            total_word_count: self.total_word_count,
            next_eligible_at: self.next_eligible_at,
            deadline_at: self.deadline_at,
            last_error: self.last_error.clone(),
        }
    }

    /// Apply a worker commit
    ///
    /// Returns false (and leaves the record untouched) when the stored cursor
    /// no longer matches the cursor the commit was planned from, or when the
    /// commit would move the cursor backwards.
    ///
    /// Progress is always written. Scheduling follows the stored status: a
    /// pause or cancel that landed while the tick was in flight wins, except
    /// that a completing commit turns a PAUSED session DONE.
    pub fn apply_commit(&mut self, commit: &ProgressCommit, now: i64) -> bool {
        debug!(id = %self.id, ?commit.status, commit.cursor, "Session::apply_commit: called");
        if self.cursor != commit.expected_cursor || commit.cursor < commit.expected_cursor {
            debug!(id = %self.id, stored = self.cursor, expected = commit.expected_cursor, "Session::apply_commit: stale");
            return false;
        }

        self.cursor = commit.cursor;
        self.applied_word_count = commit.applied_word_count;
        self.nap_until = commit.nap_until;
        self.claimed_until = None;
        self.last_error = commit.last_error.clone();

        match self.status {
            SessionStatus::Running => {
                self.status = commit.status;
                self.next_eligible_at = if commit.status == SessionStatus::Running {
                    commit.next_eligible_at
                } else {
                    None
                };
            }
            SessionStatus::Paused => {
                if commit.status == SessionStatus::Done {
                    self.status = SessionStatus::Done;
                }
                self.next_eligible_at = None;
            }
            SessionStatus::Done | SessionStatus::Canceled => {
                self.next_eligible_at = None;
            }
        }

        self.updated_at = now;
        true
    }

    /// Apply a status compare-and-set; returns false if `from` did not match
    pub fn apply_transition(&mut self, transition: &StatusTransition, now: i64) -> bool {
        debug!(id = %self.id, from = ?transition.from, to = %transition.to, "Session::apply_transition: called");
        if !transition.from.contains(&self.status) {
            return false;
        }

        self.status = transition.to;
        self.next_eligible_at = if transition.to == SessionStatus::Running {
            transition.next_eligible_at
        } else {
            None
        };
        self.nap_until = None;
        if transition.clear_error {
            self.last_error = None;
        }
        self.updated_at = now;
        true
    }
}

/// The single atomic write a worker performs after a tick
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressCommit {
    /// Cursor the tick was planned from
    pub expected_cursor: usize,
    pub cursor: usize,
    pub applied_word_count: usize,
    /// Running, Done, or Paused (terminal failure / halted)
    pub status: SessionStatus,
    pub next_eligible_at: Option<i64>,
    pub nap_until: Option<i64>,
    pub last_error: Option<String>,
}

impl ProgressCommit {
    /// A commit that keeps progress where it is
    pub fn unchanged(session: &Session) -> Self {
        Self {
            expected_cursor: session.cursor,
            cursor: session.cursor,
            applied_word_count: session.applied_word_count,
            status: SessionStatus::Running,
            next_eligible_at: None,
            nap_until: None,
            last_error: None,
        }
    }
}

/// Compare-and-set on the session status
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    /// Statuses the record must currently have
    pub from: Vec<SessionStatus>,
    pub to: SessionStatus,
    /// Only used when `to` is Running
    pub next_eligible_at: Option<i64>,
    pub clear_error: bool,
}

/// Committed session state reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub id: String,
    pub status: SessionStatus,
    pub applied_word_count: usize,
    pub total_word_count: usize,
    pub next_eligible_at: Option<i64>,
    pub deadline_at: i64,
    pub last_error: Option<String>,
}
