//! Tick scheduling
//!
//! Delayed "kick" delivery for sessions plus the sweep settings. The worker
//! asks the scheduler to poke a session after a delay; the periodic sweep is
//! the safety net when a kick is lost.

mod config;
mod core;

pub use config::SweepConfig;
pub use core::{ChannelScheduler, NullScheduler, RecordingScheduler, Scheduler, SchedulerError};
