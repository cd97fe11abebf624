//! Registry of the worker's own tools.
//!
//! Built once at startup and handed to the orchestrator; it is never a
//! process-wide singleton. Plugin tools stay with the extension registry and
//! are merged per job.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ToolError;
use crate::tools::tool::Tool;

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Each name can be registered once; a second tool with the
    /// same name is refused and the first one stays.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        match self.tools.write().await.entry(name.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(tool = %name, "Rejected duplicate tool registration");
                Err(ToolError::AlreadyRegistered { name })
            }
            Entry::Vacant(slot) => {
                slot.insert(tool);
                tracing::debug!(tool = %name, "Registered tool");
                Ok(())
            }
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn count(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Every registered tool, in no particular order.
    pub async fn all(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobContext;
    use crate::tools::tool::{ToolError as ExecError, ToolOutput};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            self.1
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &JobContext,
        ) -> Result<ToolOutput, ExecError> {
            Ok(ToolOutput::text(self.1, Duration::ZERO))
        }
    }

    #[tokio::test]
    async fn duplicate_name_is_refused_and_first_wins() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Named("current_time", "clock"))).await.unwrap();

        let err = registry
            .register(Arc::new(Named("current_time", "impostor")))
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::AlreadyRegistered { ref name } if name == "current_time"));
        assert_eq!(registry.count().await, 1);
        let kept = registry.all().await;
        assert_eq!(kept[0].description(), "clock");
    }

    #[tokio::test]
    async fn all_returns_every_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Named("a", "first"))).await.unwrap();
        registry.register(Arc::new(Named("b", "second"))).await.unwrap();

        let mut names: Vec<String> = registry
            .all()
            .await
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["a", "b"]);
        assert!(registry.contains("a").await);
        assert!(!registry.contains("c").await);
    }
}
