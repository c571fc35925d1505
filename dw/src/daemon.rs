//! Foreground daemon
//!
//! Runs the periodic sweep and delivers scheduler kicks to the worker. Both
//! paths call the same targeted tick, so a session kicked and swept at once
//! is simply claimed by one of them.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::scheduler::SweepConfig;
use crate::worker::{TickOutcome, Worker};

/// Sweep + kick loop
pub struct Daemon {
    worker: Arc<Worker>,
    kicks: mpsc::Receiver<String>,
    config: SweepConfig,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl Daemon {
    pub fn new(worker: Arc<Worker>, kicks: mpsc::Receiver<String>, config: SweepConfig) -> Self {
        debug!(?config, "Daemon::new: called");
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_ticks.max(1))),
            worker,
            kicks,
            config,
            tasks: JoinSet::new(),
        }
    }

    /// Run until `shutdown_rx` fires, then wait for in-flight ticks
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        debug!("Daemon::run: called");
        info!(
            interval_secs = self.config.interval_secs,
            batch_size = self.config.batch_size,
            "Daemon starting"
        );

        // First tick completes immediately, so due sessions are swept on startup
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));

        loop {
            tokio::select! {
                Some(session_id) = self.kicks.recv() => {
                    debug!(%session_id, "Daemon::run: kick received");
                    self.spawn_tick(session_id);
                }

                _ = interval.tick() => {
                    self.sweep().await;
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Tick task panicked");
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!("Daemon::run: shutdown signal received");
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        debug!(in_flight = self.tasks.len(), "Daemon::run: draining in-flight ticks");
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Tick task panicked");
            }
        }

        info!("Daemon stopped");
        Ok(())
    }

    async fn sweep(&mut self) {
        debug!("Daemon::sweep: called");
        match self.worker.due(self.config.batch_size).await {
            Ok(due) => {
                debug!(count = due.len(), "Daemon::sweep: due sessions");
                for session_id in due {
                    self.spawn_tick(session_id);
                }
            }
            Err(e) => warn!(error = %e, "Sweep failed, retrying next interval"),
        }
    }

    fn spawn_tick(&mut self, session_id: String) {
        let worker = self.worker.clone();
        let semaphore = self.semaphore.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            match worker.tick(Some(&session_id)).await {
                Ok(TickOutcome::NotDue { .. }) | Ok(TickOutcome::RaceLost { .. }) => {
                    debug!(%session_id, "Daemon::spawn_tick: nothing to do");
                }
                Ok(outcome) => info!(%outcome, "Tick processed"),
                Err(e) => error!(%session_id, error = %e, "Tick failed"),
            }
        });
    }
}
