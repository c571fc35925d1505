//! DripWriter - paced text release into external documents
//!
//! A session takes a block of text and releases it into a target document
//! over a chosen duration, in bursts and pauses that resemble a person
//! typing. Any number of workers may process the same session; the session
//! record itself is the only lock.
//!
//! # Core Concepts
//!
//! - **Pure Planning**: The pacing planner decides each chunk from committed state and an injected RNG
//! - **Claim Before Work**: A conditional update grants one processor the tick
//! - **Cursor Is Truth**: Word counts are derived from the token cursor and checked, never clamped
//! - **Classified Failures**: Transient errors back off, terminal ones pause the session
//!
//! # Modules
//!
//! - [`domain`] - Session entity, ids, tokenizer
//! - [`pacing`] - Pacing planner and its configuration
//! - [`store`] - Session store contract, in-memory and SQLite stores
//! - [`claim`] - Claim coordinator
//! - [`worker`] - Claim-and-tick worker and failure classification
//! - [`docs`] / [`auth`] - Document appender and token provider contracts
//! - [`scheduler`] - Delayed kicks and sweep settings
//! - [`control`] - Start/pause/resume/cancel/status
//! - [`daemon`] - Sweep + kick loop
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod auth;
pub mod claim;
pub mod cli;
pub mod clock;
pub mod config;
pub mod control;
pub mod daemon;
pub mod docs;
pub mod domain;
pub mod error;
pub mod pacing;
pub mod scheduler;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use auth::{StaticTokenProvider, TokenError, TokenProvider};
pub use claim::{ClaimCoordinator, ClaimOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, Config, DocumentsConfig, StorageConfig};
pub use control::{DripController, MAX_DURATION_MINUTES, RepairReport};
pub use daemon::Daemon;
pub use docs::{AppendError, DocumentAppender, FileAppender, MemoryAppender};
pub use domain::{ProgressCommit, Session, SessionStatus, StatusTransition, StatusView, Token, tokenize};
pub use error::{DripError, InvariantViolation};
pub use pacing::{Chunk, PacingConfig, PlanDecision, PlanInput, Planner};
pub use scheduler::{ChannelScheduler, NullScheduler, RecordingScheduler, Scheduler, SchedulerError, SweepConfig};
pub use store::{MemoryStore, SessionStore, SqliteStore, StoreError};
pub use worker::{Failure, FailureClass, TickOutcome, Worker, WorkerConfig, WorkerError};
