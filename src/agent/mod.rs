//! Agent module: context handling before generation.

pub mod compaction;
pub mod context_monitor;

pub use compaction::{CompactionResult, ContextCompactor, SUMMARY_PREFIX, fallback_summary, summary_message};
pub use context_monitor::{ContextMonitor, GuardOutcome};
