//! Tool abstraction, policy filtering and approval gating.

pub mod approval;
pub mod builtin;
pub mod policy;
pub mod registry;
pub mod tool;

pub use approval::{ApprovalGate, ApprovalGatedTool};
pub use policy::{ToolPolicy, filter_tools, merge_tool_policies, resolve_effective_policy};
pub use registry::ToolRegistry;
pub use tool::*;
