//! `memory_search`: look up stored memories such as earlier conversation summaries.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::JobContext;
use crate::store::MemoryStore;
use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

/// Tool for searching the memory store.
pub struct MemorySearchTool {
    memories: Arc<dyn MemoryStore>,
}

impl MemorySearchTool {
    pub fn new(memories: Arc<dyn MemoryStore>) -> Self {
        Self { memories }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search past memories, including summaries of earlier parts of this \
         conversation. Call before answering questions about things discussed \
         long ago. Returns matching snippets, newest first."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Text to look for (case-insensitive)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Max results (default: 5, max: 20)",
                    "default": 5
                },
                "all_conversations": {
                    "type": "boolean",
                    "description": "Search beyond the current conversation (default: false)",
                    "default": false
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &JobContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let query = require_str(&params, "query")?;
        let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(5).min(20) as usize;
        let all = params
            .get("all_conversations")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let scope = if all { None } else { Some(ctx.conversation_id) };

        let results = self
            .memories
            .search_memories(scope, query, limit)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Search failed: {}", e)))?;

        let output = serde_json::json!({
            "query": query,
            "results": results.iter().map(|m| serde_json::json!({
                "kind": m.kind,
                "content": m.content,
                "created_at": m.created_at.to_rfc3339(),
            })).collect::<Vec<_>>(),
            "result_count": results.len(),
        });

        Ok(ToolOutput::success(output, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn searches_current_conversation_by_default() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = JobContext::default();
        store
            .store_memory(Some(ctx.conversation_id), "conversation_summary", "Planned a trip to Lisbon")
            .await
            .unwrap();
        store
            .store_memory(None, "note", "Lisbon has trams")
            .await
            .unwrap();
        let tool = MemorySearchTool::new(store);

        let out = tool
            .execute(serde_json::json!({"query": "lisbon"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["result_count"], 1);

        let out = tool
            .execute(
                serde_json::json!({"query": "lisbon", "all_conversations": true}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.result["result_count"], 2);
    }

    #[tokio::test]
    async fn query_is_required() {
        let tool = MemorySearchTool::new(Arc::new(InMemoryStore::new()));
        let err = tool
            .execute(serde_json::json!({}), &JobContext::default())
            .await;
        assert!(matches!(err, Err(ToolError::InvalidParameters(_))));
    }
}
