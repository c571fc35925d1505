//! Pacing planner
//!
//! Decides, per tick, how much text a session releases and when it naps.

mod config;
mod planner;

pub use config::PacingConfig;
pub use planner::{Chunk, PlanDecision, PlanInput, Planner};
