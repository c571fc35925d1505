//! Pacing planner
//!
//! A pure function of committed session state, the current time, and an
//! injected random source. It decides whether a tick releases a chunk, starts
//! a nap, or does nothing.
//!
//! Progress follows a linear target curve from `started_at` to `deadline_at`.
//! The target is sampled a few ticks ahead so a burst can recover a backlog
//! after a nap, bursts are capped (with a larger cap while behind), and the
//! last tick before the deadline releases everything that is left.

use rand::Rng;
use tracing::debug;

use super::config::PacingConfig;
use crate::domain::{Session, Token, count_words, join, words_before};
use crate::error::InvariantViolation;

/// Everything the planner looks at
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub session_id: &'a str,
    pub tokens: &'a [Token],
    pub cursor: usize,
    pub applied_word_count: usize,
    pub total_word_count: usize,
    pub tick_interval_ms: i64,
    pub started_at: i64,
    pub deadline_at: i64,
    pub now: i64,
    pub nap_until: Option<i64>,
}

impl<'a> PlanInput<'a> {
    /// Planner input from a committed session record
    pub fn from_session(session: &'a Session, now: i64) -> Self {
        Self {
            session_id: &session.id,
            tokens: &session.tokens,
            cursor: session.cursor,
            applied_word_count: session.applied_word_count,
            total_word_count: session.total_word_count,
            tick_interval_ms: session.tick_interval_ms,
            started_at: session.started_at,
            deadline_at: session.deadline_at,
            now,
            nap_until: session.nap_until,
        }
    }
}

/// A contiguous token slice to append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub new_cursor: usize,
    pub added_words: usize,
}

/// Planner output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    /// Append this chunk, then advance the cursor
    Emit(Chunk),
    /// Stay idle until the given time
    Nap { until: i64 },
    /// Nothing to do this tick
    Noop,
}

/// Timing snapshot for one plan call
#[derive(Debug, Clone, Copy)]
struct Timing {
    total_ms: i64,
    elapsed_ms: i64,
    tick_ms: i64,
    ticks_remaining: usize,
    lookahead: usize,
}

impl Timing {
    fn at(input: &PlanInput<'_>, config: &PacingConfig) -> Self {
        let tick_ms = input.tick_interval_ms.max(1);
        let total_ms = (input.deadline_at - input.started_at).max(1);
        let elapsed_ms = (input.now - input.started_at).max(0);
        let remaining_ms = (input.deadline_at - input.now).max(0);
        let ticks_remaining = ticks_in(remaining_ms, tick_ms).max(1);
        let lookahead = ticks_remaining.min(config.lookahead_ticks.max(1) as usize);

        Self {
            total_ms,
            elapsed_ms,
            tick_ms,
            ticks_remaining,
            lookahead,
        }
    }

    fn elapsed_fraction(&self) -> f64 {
        (self.elapsed_ms as f64 / self.total_ms as f64).min(1.0)
    }

    fn is_last_tick(&self) -> bool {
        self.ticks_remaining <= 1
    }

    /// Linear-curve word target `offset_ms` from now
    fn target_at(&self, total_words: usize, offset_ms: i64) -> usize {
        let fraction = ((self.elapsed_ms + offset_ms) as f64 / self.total_ms as f64).min(1.0);
        (total_words as f64 * fraction).floor() as usize
    }
}

/// Whole ticks that fit in a span, rounded to nearest
fn ticks_in(span_ms: i64, tick_ms: i64) -> usize {
    (span_ms as f64 / tick_ms as f64).round() as usize
}

/// Decides what each tick does
#[derive(Debug, Clone, Default)]
pub struct Planner {
    config: PacingConfig,
}

impl Planner {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Plan one tick
    ///
    /// Identical inputs and an identically seeded `rng` always produce the
    /// same decision. Accounting errors are returned, never corrected.
    pub fn plan<R: Rng>(&self, input: &PlanInput<'_>, rng: &mut R) -> Result<PlanDecision, InvariantViolation> {
        debug!(
            session_id = %input.session_id,
            cursor = input.cursor,
            applied = input.applied_word_count,
            total = input.total_word_count,
            now = input.now,
            "Planner::plan: called"
        );
        check_accounting(input)?;

        if input.applied_word_count >= input.total_word_count {
            debug!(session_id = %input.session_id, "Planner::plan: already complete");
            return Ok(PlanDecision::Noop);
        }

        let timing = Timing::at(input, &self.config);
        let remaining = input.total_word_count - input.applied_word_count;

        if !timing.is_last_tick() {
            if let Some(until) = input.nap_until.filter(|until| input.now < *until) {
                debug!(session_id = %input.session_id, until, "Planner::plan: nap in progress");
                return Ok(PlanDecision::Nap {
                    until: until.min(input.deadline_at),
                });
            }

            if input.applied_word_count > 0 {
                if let Some(until) = self.maybe_nap(input, &timing, remaining, rng) {
                    debug!(session_id = %input.session_id, until, "Planner::plan: scheduling nap");
                    return Ok(PlanDecision::Nap { until });
                }
            }
        }

        let delta = if timing.is_last_tick() {
            debug!(session_id = %input.session_id, remaining, "Planner::plan: last tick, forcing completion");
            remaining
        } else {
            self.paced_delta(input, &timing, remaining, rng)
        };

        if delta == 0 {
            debug!(session_id = %input.session_id, "Planner::plan: zero delta");
            return Ok(PlanDecision::Noop);
        }

        materialize(input, delta)
    }

    /// Word delta for a regular (not last) tick
    fn paced_delta<R: Rng>(&self, input: &PlanInput<'_>, timing: &Timing, remaining: usize, rng: &mut R) -> usize {
        let applied = input.applied_word_count;
        let total = input.total_word_count;

        let current = timing.target_at(total, 0);
        let next = timing.target_at(total, timing.tick_ms);
        let future = timing.target_at(total, timing.lookahead as i64 * timing.tick_ms);

        let backlog = current.saturating_sub(applied);
        let mut delta = future
            .saturating_sub(applied)
            .div_ceil(timing.lookahead)
            .max(next.saturating_sub(applied));

        let amplitude = self.config.jitter_words.min(delta / 2) as i64;
        if amplitude > 0 {
            let offset = rng.random_range(-amplitude..=amplitude);
            delta = (delta as i64 + offset).max(0) as usize;
        }

        let catching_up = backlog > 0 || remaining > timing.ticks_remaining * self.config.max_burst;
        let cap = if catching_up {
            self.config.max_burst_catchup
        } else {
            self.config.max_burst
        };
        delta = delta.min(cap);

        if applied == 0 {
            delta = delta.max(self.config.initial_burst.max(1));
        }

        debug!(
            session_id = %input.session_id,
            backlog,
            catching_up,
            delta,
            "Planner::paced_delta: computed"
        );
        delta.min(remaining)
    }

    /// Maybe start a nap; only when the run can still finish afterwards
    fn maybe_nap<R: Rng>(&self, input: &PlanInput<'_>, timing: &Timing, remaining: usize, rng: &mut R) -> Option<i64> {
        let fraction = timing.elapsed_fraction();
        let long_chance = self.config.long_nap_chance * (1.0 - fraction);
        let medium_chance = self.config.medium_nap_chance * (0.5 + 0.5 * fraction);

        let try_long = rng.random::<f64>() < long_chance;
        let try_medium = rng.random::<f64>() < medium_chance;

        let (lo, hi) = if try_long {
            self.config.long_nap_ms
        } else if try_medium {
            self.config.medium_nap_ms
        } else {
            return None;
        };

        let duration = rng.random_range(lo.min(hi)..=hi.max(lo));
        let until = (input.now + duration).min(input.deadline_at);
        if until <= input.now {
            return None;
        }

        let ticks_after = ticks_in(input.deadline_at - until, timing.tick_ms).max(1);
        if remaining > ticks_after * self.config.max_burst_catchup {
            debug!(session_id = %input.session_id, remaining, ticks_after, "Planner::maybe_nap: cannot afford nap");
            return None;
        }

        Some(until)
    }
}

/// Cursor and cached counts must agree before anything is planned
fn check_accounting(input: &PlanInput<'_>) -> Result<(), InvariantViolation> {
    let violation = |detail: String| InvariantViolation::new(input.session_id, detail);
    let len = input.tokens.len();

    if input.cursor > len {
        return Err(violation(format!("cursor {} past end of stream ({} tokens)", input.cursor, len)));
    }
    if input.applied_word_count > input.total_word_count {
        return Err(violation(format!(
            "applied word count {} exceeds total {}",
            input.applied_word_count, input.total_word_count
        )));
    }
    if input.cursor == len && input.applied_word_count < input.total_word_count {
        return Err(violation(format!(
            "cursor at end of stream with {} of {} words applied",
            input.applied_word_count, input.total_word_count
        )));
    }

    let stream_words = count_words(input.tokens);
    if stream_words != input.total_word_count {
        return Err(violation(format!(
            "total word count {} does not match token stream ({} words)",
            input.total_word_count, stream_words
        )));
    }

    let derived = words_before(input.tokens, input.cursor);
    if derived != input.applied_word_count {
        return Err(violation(format!(
            "applied word count {} does not match cursor {} ({} words)",
            input.applied_word_count, input.cursor, derived
        )));
    }

    Ok(())
}

/// Walk the stream from the cursor until `delta` words are covered
///
/// Whitespace rides along with the words around it. The final chunk also
/// takes any trailing whitespace so the chunks reproduce the source exactly.
fn materialize(input: &PlanInput<'_>, delta: usize) -> Result<PlanDecision, InvariantViolation> {
    let tokens = input.tokens;
    let mut end = input.cursor;
    let mut added = 0;

    while end < tokens.len() && added < delta {
        if tokens[end].is_word() {
            added += 1;
        }
        end += 1;
    }

    if added == 0 {
        return Ok(PlanDecision::Noop);
    }

    let applied_after = input.applied_word_count + added;
    if added < delta && applied_after < input.total_word_count {
        return Err(InvariantViolation::new(
            input.session_id,
            format!(
                "end of stream after {} words with {} of {} applied",
                added, applied_after, input.total_word_count
            ),
        ));
    }
    if applied_after == input.total_word_count {
        end = tokens.len();
    }

    Ok(PlanDecision::Emit(Chunk {
        text: join(&tokens[input.cursor..end]),
        new_cursor: end,
        added_words: added,
    }))
}
