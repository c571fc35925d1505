//! Scheduler implementations

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Scheduler failures; callers log these and rely on the sweep
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Scheduler channel closed")]
    Closed,

    #[error("Scheduler rejected {session_id}: {reason}")]
    Rejected { session_id: String, reason: String },
}

/// Delivers a kick for a session after a delay
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn enqueue(&self, session_id: &str, delay: Duration) -> Result<(), SchedulerError>;
}

/// In-process scheduler: sleeps the delay, then sends the id to the daemon
#[derive(Debug, Clone)]
pub struct ChannelScheduler {
    tx: mpsc::Sender<String>,
}

impl ChannelScheduler {
    /// Create the scheduler and the receiving end the daemon listens on
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        debug!(buffer, "ChannelScheduler::new: called");
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Scheduler for ChannelScheduler {
    async fn enqueue(&self, session_id: &str, delay: Duration) -> Result<(), SchedulerError> {
        debug!(%session_id, delay_ms = delay.as_millis() as u64, "ChannelScheduler::enqueue: called");
        if self.tx.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let tx = self.tx.clone();
        let id = session_id.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if tx.send(id).await.is_err() {
                debug!("ChannelScheduler::enqueue: receiver gone, kick dropped");
            }
        });
        Ok(())
    }
}

/// Drops every kick; one-shot processes rely on the sweep instead
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScheduler;

#[async_trait]
impl Scheduler for NullScheduler {
    async fn enqueue(&self, session_id: &str, delay: Duration) -> Result<(), SchedulerError> {
        debug!(%session_id, delay_ms = delay.as_millis() as u64, "NullScheduler::enqueue: called");
        Ok(())
    }
}

/// Records every kick (tests and simulations)
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    entries: Mutex<Vec<(String, Duration)>>,
    failing: AtomicBool,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent enqueues fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<(String, Duration)> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn enqueue(&self, session_id: &str, delay: Duration) -> Result<(), SchedulerError> {
        debug!(%session_id, delay_ms = delay.as_millis() as u64, "RecordingScheduler::enqueue: called");
        if self.failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected {
                session_id: session_id.to_string(),
                reason: "scheduler offline".to_string(),
            });
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((session_id.to_string(), delay));
        }
        Ok(())
    }
}
