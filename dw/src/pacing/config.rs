//! Pacing configuration

use serde::{Deserialize, Serialize};

/// Tuning knobs for the pacing planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Nominal spacing between ticks in milliseconds
    #[serde(rename = "tick-interval-ms")]
    pub tick_interval_ms: i64,

    /// Short sessions shrink the tick interval so they get at least this many ticks
    #[serde(rename = "min-ticks")]
    pub min_ticks: u32,

    /// How many ticks ahead the target curve is sampled
    #[serde(rename = "lookahead-ticks")]
    pub lookahead_ticks: u32,

    /// Per-tick word ceiling when on schedule
    #[serde(rename = "max-burst")]
    pub max_burst: usize,

    /// Per-tick word ceiling when behind schedule
    #[serde(rename = "max-burst-catchup")]
    pub max_burst_catchup: usize,

    /// Maximum signed jitter applied to each delta
    #[serde(rename = "jitter-words")]
    pub jitter_words: usize,

    /// Minimum words on the first productive tick
    #[serde(rename = "initial-burst")]
    pub initial_burst: usize,

    /// Base probability of a long nap (scaled down as the run progresses)
    #[serde(rename = "long-nap-chance")]
    pub long_nap_chance: f64,

    /// Base probability of a medium nap (scaled up as the run progresses)
    #[serde(rename = "medium-nap-chance")]
    pub medium_nap_chance: f64,

    /// Long nap duration range in milliseconds (inclusive)
    #[serde(rename = "long-nap-ms")]
    pub long_nap_ms: (i64, i64),

    /// Medium nap duration range in milliseconds (inclusive)
    #[serde(rename = "medium-nap-ms")]
    pub medium_nap_ms: (i64, i64),
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 80_000,
            min_ticks: 8,
            lookahead_ticks: 8,
            max_burst: 12,
            max_burst_catchup: 28,
            jitter_words: 2,
            initial_burst: 1,
            long_nap_chance: 0.05,
            medium_nap_chance: 0.15,
            long_nap_ms: (60_000, 180_000),
            medium_nap_ms: (15_000, 45_000),
        }
    }
}

impl PacingConfig {
    /// Tick interval for a session of the given length
    pub fn tick_interval_for(&self, duration_ms: i64) -> i64 {
        let spread = duration_ms / i64::from(self.min_ticks.max(1));
        self.tick_interval_ms.min(spread).max(1_000)
    }

    /// Configuration with naps disabled (deterministic cadence)
    pub fn without_naps(mut self) -> Self {
        self.long_nap_chance = 0.0;
        self.medium_nap_chance = 0.0;
        self
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.tick_interval_ms <= 0 {
            return Err(eyre::eyre!("pacing.tick-interval-ms must be positive"));
        }
        if self.max_burst == 0 || self.max_burst_catchup < self.max_burst {
            return Err(eyre::eyre!(
                "pacing.max-burst must be positive and not exceed pacing.max-burst-catchup"
            ));
        }
        for (name, chance) in [
            ("long-nap-chance", self.long_nap_chance),
            ("medium-nap-chance", self.medium_nap_chance),
        ] {
            if !(0.0..=1.0).contains(&chance) {
                return Err(eyre::eyre!("pacing.{} must be within 0..=1", name));
            }
        }
        for (name, (lo, hi)) in [("long-nap-ms", self.long_nap_ms), ("medium-nap-ms", self.medium_nap_ms)] {
            if lo < 0 || lo > hi {
                return Err(eyre::eyre!("pacing.{} must be a non-negative [min, max] range", name));
            }
        }
        Ok(())
    }
}
