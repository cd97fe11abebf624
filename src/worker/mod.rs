//! Worker system: leases, the per-job pipeline and the queue loop.
//!
//! Core components:
//! - `lease`: claim, heartbeat and lease-loss checkpoints for one job
//! - `reconcile`: requeue or fail jobs whose lease expired
//! - `orchestrator`: claim → context → tools → generation → persist
//! - `worker`: poll loop, one job at a time
//! - `activity`: broadcast of structured progress events

pub mod activity;
pub mod lease;
pub mod orchestrator;
pub mod reconcile;
pub mod worker;

pub use activity::{ActivityFeed, WorkerActivity};
pub use lease::{LeaseCoordinator, LeaseState};
pub use orchestrator::{JobDisposition, Orchestrator, OrchestratorDeps};
pub use reconcile::{ReconcileReport, reconcile_stale_jobs};
pub use worker::{PollStats, Worker};
