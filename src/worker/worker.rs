//! Queue poll loop.
//!
//! One worker processes one job at a time. Pending jobs are fetched in
//! batches and run sequentially; the stale-job reconciliation pass runs on its
//! own interval between jobs. A batch where no job could be processed counts
//! as idle, so a failing store is polled at `poll_interval` and no faster.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::error::DatabaseError;
use crate::store::JobStore;
use crate::worker::orchestrator::{JobDisposition, Orchestrator};
use crate::worker::reconcile::reconcile_stale_jobs;

/// Totals for one `run_once` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub fetched: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub aborted: usize,
    pub skipped: usize,
}

impl PollStats {
    /// Whether any job in the batch reached a disposition of its own.
    /// Skipped jobs (store errors, claimed elsewhere) do not count.
    pub fn made_progress(&self) -> bool {
        self.completed + self.requeued + self.failed + self.aborted > 0
    }

    fn record(&mut self, disposition: &JobDisposition) {
        match disposition {
            JobDisposition::NotClaimed => self.skipped += 1,
            JobDisposition::Completed { .. } => self.completed += 1,
            JobDisposition::Requeued { .. } => self.requeued += 1,
            JobDisposition::Failed { .. } => self.failed += 1,
            JobDisposition::Aborted { .. } => self.aborted += 1,
        }
    }
}

pub struct Worker {
    orchestrator: Orchestrator,
    jobs: Arc<dyn JobStore>,
    config: Arc<WorkerConfig>,
}

impl Worker {
    pub fn new(orchestrator: Orchestrator, jobs: Arc<dyn JobStore>, config: Arc<WorkerConfig>) -> Self {
        Self {
            orchestrator,
            jobs,
            config,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Fetch one batch and process it, stopping early if `shutdown` flips.
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> Result<PollStats, DatabaseError> {
        let batch = self.jobs.pending_jobs(self.config.batch_size).await?;
        let mut stats = PollStats {
            fetched: batch.len(),
            ..PollStats::default()
        };

        for job in &batch {
            if *shutdown.borrow() {
                break;
            }
            match self.orchestrator.process(job).await {
                Ok(disposition) => stats.record(&disposition),
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Store error while processing job");
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Poll until `shutdown` is set to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            processor_id = %self.config.processor_id,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Worker started"
        );

        let mut last_reconcile: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_reconcile.is_none_or(|at| at.elapsed() >= self.config.reconcile_interval) {
                if let Err(e) =
                    reconcile_stale_jobs(self.jobs.as_ref(), &self.config.lease, Utc::now()).await
                {
                    tracing::warn!(error = %e, "Reconciliation pass failed");
                }
                last_reconcile = Some(Instant::now());
            }

            let idle = match self.run_once(&shutdown).await {
                Ok(stats) => {
                    if stats.fetched > 0 {
                        tracing::debug!(
                            fetched = stats.fetched,
                            completed = stats.completed,
                            requeued = stats.requeued,
                            failed = stats.failed,
                            aborted = stats.aborted,
                            skipped = stats.skipped,
                            "Poll batch done"
                        );
                    }
                    !stats.made_progress()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to fetch pending jobs");
                    true
                }
            };

            // Nothing moved: empty queue, or every job was skipped.
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(processor_id = %self.config.processor_id, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_jobs_are_not_progress() {
        let mut stats = PollStats {
            fetched: 3,
            ..PollStats::default()
        };
        stats.record(&JobDisposition::NotClaimed);
        stats.skipped += 2;
        assert!(!stats.made_progress());

        stats.record(&JobDisposition::Failed {
            reason: "auth".into(),
        });
        assert!(stats.made_progress());
    }
}
