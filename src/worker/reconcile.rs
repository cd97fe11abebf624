//! Recovery of jobs whose worker went away.
//!
//! A `processing` job whose lease has expired is handed back to the queue
//! while it still has attempts left, and failed otherwise. Every write is
//! fenced on the processor that held the lease, so a worker that is merely
//! slow and renews in the meantime keeps its job.

use chrono::{DateTime, Utc};

use crate::config::LeaseConfig;
use crate::error::DatabaseError;
use crate::store::JobStore;

/// Failure reason recorded on jobs that ran out of attempts.
pub const LEASE_EXPIRED_REASON: &str = "lease_expired";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub requeued: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0
    }
}

/// One pass over every `processing` job.
pub async fn reconcile_stale_jobs(
    jobs: &dyn JobStore,
    config: &LeaseConfig,
    now: DateTime<Utc>,
) -> Result<ReconcileReport, DatabaseError> {
    let mut report = ReconcileReport::default();

    for job in jobs.processing_jobs().await? {
        if !job.is_stale(now, config.legacy_stale_threshold) {
            continue;
        }
        let holder = job.processor_id.as_deref();

        if job.attempt_count + 1 < config.max_attempts {
            if jobs.requeue(job.id, holder).await? {
                tracing::info!(
                    job_id = %job.id,
                    processor_id = holder.unwrap_or("-"),
                    attempt = job.attempt_count + 1,
                    "Requeued stale job"
                );
                report.requeued += 1;
            }
        } else {
            let message = format!(
                "Lease expired after {} attempt(s); last processor {}",
                job.attempt_count + 1,
                holder.unwrap_or("unknown")
            );
            if jobs.fail(job.id, holder, LEASE_EXPIRED_REASON, &message).await? {
                tracing::warn!(job_id = %job.id, attempts = job.attempt_count + 1, "Failed stale job");
                report.failed += 1;
            }
        }
    }

    if !report.is_empty() {
        tracing::info!(requeued = report.requeued, failed = report.failed, "Reconciliation pass done");
    }
    Ok(report)
}
