//! Claim-and-tick worker
//!
//! One tick is claim, plan, append, commit. Any number of workers may run
//! the same tick concurrently; the claim decides who proceeds and every
//! collaborator failure is classified before state is touched.

mod config;
mod core;
mod failure;

pub use config::WorkerConfig;
pub use core::{TickOutcome, Worker, WorkerError};
pub use failure::{Failure, FailureClass};
