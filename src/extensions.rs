//! Plugins and skills: the optional layers of a job's tool policy.
//!
//! A plugin contributes tools and may carry its own policy. A skill is a named
//! policy a conversation can switch on. The registry is built once at startup
//! and injected into the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use crate::store::Conversation;
use crate::tools::policy::ToolPolicy;
use crate::tools::tool::Tool;

/// An installed plugin.
pub struct Plugin {
    pub name: String,
    pub tools: Vec<Arc<dyn Tool>>,
    pub policy: Option<ToolPolicy>,
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            policy: None,
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_policy(mut self, policy: ToolPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

#[derive(Default)]
pub struct ExtensionRegistry {
    plugins: Vec<Plugin>,
    skills: HashMap<String, ToolPolicy>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        tracing::debug!(plugin = %plugin.name, tools = plugin.tools.len(), "Plugin installed");
        self.plugins.push(plugin);
        self
    }

    pub fn with_skill(mut self, name: impl Into<String>, policy: ToolPolicy) -> Self {
        self.skills.insert(name.into(), policy);
        self
    }

    /// Every tool contributed by plugins.
    pub fn plugin_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.plugins
            .iter()
            .flat_map(|p| p.tools.iter().cloned())
            .collect()
    }

    /// Policy layers for `conversation`: skills, then plugins, then the agent override.
    pub fn policy_layers(&self, conversation: &Conversation) -> Vec<ToolPolicy> {
        let mut layers = Vec::new();
        for skill in &conversation.active_skills {
            match self.skills.get(skill) {
                Some(policy) => layers.push(policy.clone()),
                None => tracing::warn!(skill = %skill, "Unknown skill on conversation, ignoring"),
            }
        }
        layers.extend(self.plugins.iter().filter_map(|p| p.policy.clone()));
        if let Some(agent) = &conversation.agent_policy {
            layers.push(agent.clone());
        }
        layers
    }
}
