//! Built-in tools: clock, memory search, and delegation.

pub mod delegate;
pub mod memory;
pub mod time;

use std::sync::Arc;

pub use delegate::DelegateTaskTool;
pub use memory::MemorySearchTool;
pub use time::CurrentTimeTool;

use crate::error::ToolError;
use crate::store::Database;
use crate::tools::ToolRegistry;

/// Register every built-in tool against one backend.
pub async fn register_builtins<D>(
    registry: &ToolRegistry,
    db: Arc<D>,
    max_delegation_depth: u32,
) -> Result<(), ToolError>
where
    D: Database + 'static,
{
    registry.register(Arc::new(CurrentTimeTool)).await?;
    registry
        .register(Arc::new(MemorySearchTool::new(db.clone())))
        .await?;
    registry
        .register(Arc::new(DelegateTaskTool::new(
            db.clone(),
            db,
            max_delegation_depth,
        )))
        .await
}
