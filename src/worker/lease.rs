//! Job lease: claim, background heartbeat, and checkpoint reads.
//!
//! The heartbeat task never returns an error to the job. When a renewal is
//! refused or fails it sets a shared flag, and the orchestrator reads that
//! flag at its checkpoints. Once set, the flag stays set.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::LeaseConfig;
use crate::context::LeaseSignal;
use crate::error::{DatabaseError, JobError};
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unclaimed,
    Claimed,
    Released,
    Lost,
}

pub struct LeaseCoordinator {
    jobs: Arc<dyn JobStore>,
    job_id: Uuid,
    processor_id: String,
    lock: Duration,
    heartbeat_interval: Duration,
    claimed: bool,
    released: bool,
    lost: LeaseSignal,
    failed_renewals: Arc<AtomicU32>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LeaseCoordinator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        job_id: Uuid,
        processor_id: impl Into<String>,
        config: &LeaseConfig,
    ) -> Self {
        Self {
            jobs,
            job_id,
            processor_id: processor_id.into(),
            lock: config.lock,
            heartbeat_interval: config.heartbeat,
            claimed: false,
            released: false,
            lost: LeaseSignal::default(),
            failed_renewals: Arc::new(AtomicU32::new(0)),
            heartbeat: None,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn processor_id(&self) -> &str {
        &self.processor_id
    }

    pub fn state(&self) -> LeaseState {
        if !self.claimed {
            LeaseState::Unclaimed
        } else if self.is_lost() {
            LeaseState::Lost
        } else if self.released {
            LeaseState::Released
        } else {
            LeaseState::Claimed
        }
    }

    /// Try to take the job. On success the heartbeat starts.
    pub async fn claim(&mut self) -> Result<bool, DatabaseError> {
        if self.claimed {
            return Ok(!self.is_lost());
        }
        if !self
            .jobs
            .claim(self.job_id, &self.processor_id, self.lock)
            .await?
        {
            tracing::debug!(job_id = %self.job_id, "Job already claimed elsewhere");
            return Ok(false);
        }
        self.claimed = true;
        self.heartbeat = Some(self.spawn_heartbeat());
        tracing::info!(
            job_id = %self.job_id,
            processor_id = %self.processor_id,
            lock_ms = self.lock.as_millis() as u64,
            "Lease acquired"
        );
        Ok(true)
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let jobs = Arc::clone(&self.jobs);
        let job_id = self.job_id;
        let processor_id = self.processor_id.clone();
        let lock = self.lock;
        let lost = self.lost.clone();
        let failures = Arc::clone(&self.failed_renewals);
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The claim itself set the first expiry.
            tick.tick().await;
            loop {
                tick.tick().await;
                let renewed = match jobs.heartbeat(job_id, &processor_id, lock).await {
                    Ok(renewed) => renewed,
                    Err(e) => {
                        tracing::warn!(%job_id, error = %e, "Heartbeat errored");
                        false
                    }
                };
                if renewed {
                    failures.store(0, Ordering::Relaxed);
                    tracing::debug!(%job_id, "Lease renewed");
                } else {
                    let n = failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if !lost.mark_lost() {
                        tracing::warn!(%job_id, %processor_id, "Lease lost");
                    }
                    tracing::debug!(%job_id, consecutive_failures = n, "Heartbeat refused");
                }
            }
        })
    }

    /// Non-blocking read of the lost flag.
    pub fn is_lost(&self) -> bool {
        self.lost.is_lost()
    }

    /// Handle on the lost flag for code that only holds a [`JobContext`](crate::context::JobContext).
    pub fn signal(&self) -> LeaseSignal {
        self.lost.clone()
    }

    /// Checkpoint before an expensive or state-mutating step.
    pub fn check(&self, phase: &str) -> Result<(), JobError> {
        if self.is_lost() {
            tracing::warn!(job_id = %self.job_id, phase, "Lease lost at checkpoint, aborting");
            return Err(JobError::LeaseLost {
                id: self.job_id,
                phase: phase.to_string(),
            });
        }
        Ok(())
    }

    /// Mark the lease lost, e.g. after a fenced write was refused.
    pub fn mark_lost(&self) {
        self.lost.mark_lost();
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failed_renewals.load(Ordering::Relaxed)
    }

    /// Stop the heartbeat. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if self.claimed {
            self.released = true;
        }
    }
}

impl Drop for LeaseCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}
