//! Worker configuration

use serde::{Deserialize, Serialize};

/// Timing knobs for the tick worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long a claim is honored before the session is claimable again
    #[serde(rename = "visibility-timeout-ms")]
    pub visibility_timeout_ms: i64,

    /// Next-tick delay as a multiple of the session tick interval, drawn uniformly
    #[serde(rename = "tick-delay-factor")]
    pub tick_delay_factor: (f64, f64),

    /// Backoff range after a transient failure (milliseconds, inclusive)
    #[serde(rename = "backoff-ms")]
    pub backoff_ms: (i64, i64),

    /// Delay before the first tick after resume
    #[serde(rename = "resume-delay-ms")]
    pub resume_delay_ms: i64,

    /// Maximum persisted length of `last_error`
    #[serde(rename = "max-error-len")]
    pub max_error_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 60_000,
            tick_delay_factor: (0.6, 1.5),
            backoff_ms: (120_000, 300_000),
            resume_delay_ms: 5_000,
            max_error_len: 1_500,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.visibility_timeout_ms <= 0 {
            return Err(eyre::eyre!("worker.visibility-timeout-ms must be positive"));
        }
        let (lo, hi) = self.tick_delay_factor;
        if !(lo > 0.0 && lo <= hi) {
            return Err(eyre::eyre!("worker.tick-delay-factor must be a positive [min, max] range"));
        }
        let (lo, hi) = self.backoff_ms;
        if lo <= 0 || lo > hi {
            return Err(eyre::eyre!("worker.backoff-ms must be a positive [min, max] range"));
        }
        if self.resume_delay_ms < 0 {
            return Err(eyre::eyre!("worker.resume-delay-ms must not be negative"));
        }
        if self.max_error_len == 0 {
            return Err(eyre::eyre!("worker.max-error-len must be positive"));
        }
        Ok(())
    }
}
