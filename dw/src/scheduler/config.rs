//! Sweep configuration

use serde::{Deserialize, Serialize};

/// Periodic sweep settings for the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps of due sessions
    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,

    /// Maximum sessions ticked per sweep
    #[serde(rename = "batch-size")]
    pub batch_size: usize,

    /// Maximum ticks in flight at once
    #[serde(rename = "max-concurrent-ticks")]
    pub max_concurrent_ticks: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            batch_size: 10,
            max_concurrent_ticks: 4,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.interval_secs == 0 {
            return Err(eyre::eyre!("sweep.interval-secs must be positive"));
        }
        if self.batch_size == 0 {
            return Err(eyre::eyre!("sweep.batch-size must be positive"));
        }
        if self.max_concurrent_ticks == 0 {
            return Err(eyre::eyre!("sweep.max-concurrent-ticks must be positive"));
        }
        Ok(())
    }
}
