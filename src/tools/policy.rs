//! Tool policy resolution.
//!
//! A job's tool set is gated by several independent policy layers: the
//! channel baseline, active skills, installed plugins and a per-agent
//! override. Layers are merged into one effective policy:
//!
//! - deny lists are unioned, so a tool denied anywhere stays denied;
//! - allow lists are intersected across the layers that define one, and
//!   layers without an allow list (or with the wildcard) impose nothing;
//! - `also_allow` lists are unioned and added back after the intersection.
//!
//! Policies are values. Merging never mutates its inputs.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channels::ChannelKind;
use crate::tools::tool::Tool;

/// Allow-list entry that permits every tool.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<BTreeSet<String>>,
    #[serde(default, alias = "alsoAllow", skip_serializing_if = "Option::is_none")]
    pub also_allow: Option<BTreeSet<String>>,
}

fn set<I, S>(names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

impl ToolPolicy {
    /// A policy that restricts nothing.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn allow_all() -> Self {
        Self {
            allow: Some(set([WILDCARD])),
            ..Self::default()
        }
    }

    pub fn allow<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: Some(set(names)),
            ..Self::default()
        }
    }

    pub fn with_deny<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny = Some(set(names));
        self
    }

    pub fn with_also_allow<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.also_allow = Some(set(names));
        self
    }

    /// True when the allow list contains the wildcard.
    pub fn is_allow_all(&self) -> bool {
        self.allow.as_ref().is_some_and(|a| a.contains(WILDCARD))
    }

    /// Whether `name` survives this policy. Deny always wins.
    pub fn permits(&self, name: &str) -> bool {
        if self.deny.as_ref().is_some_and(|d| d.contains(name)) {
            return false;
        }
        match &self.allow {
            None => true,
            Some(_) if self.is_allow_all() => true,
            Some(allow) => {
                allow.contains(name) || self.also_allow.as_ref().is_some_and(|a| a.contains(name))
            }
        }
    }
}

/// Keep only the tools `policy` permits.
pub fn filter_tools(tools: Vec<Arc<dyn Tool>>, policy: &ToolPolicy) -> Vec<Arc<dyn Tool>> {
    tools
        .into_iter()
        .filter(|tool| policy.permits(tool.name()))
        .collect()
}

/// Merge policy layers into one.
pub fn merge_tool_policies(policies: &[ToolPolicy]) -> ToolPolicy {
    let mut deny: Option<BTreeSet<String>> = None;
    let mut also_allow: Option<BTreeSet<String>> = None;
    let mut allow: Option<BTreeSet<String>> = None;
    let mut saw_wildcard = false;

    for policy in policies {
        if let Some(d) = &policy.deny {
            deny.get_or_insert_with(BTreeSet::new).extend(d.iter().cloned());
        }
        if let Some(a) = &policy.also_allow {
            also_allow.get_or_insert_with(BTreeSet::new).extend(a.iter().cloned());
        }
        match &policy.allow {
            None => {}
            Some(_) if policy.is_allow_all() => saw_wildcard = true,
            Some(a) => {
                allow = Some(match allow {
                    None => a.clone(),
                    Some(acc) => acc.intersection(a).cloned().collect(),
                });
            }
        }
    }

    let allow = match allow {
        Some(mut restricted) => {
            if let Some(extra) = &also_allow {
                restricted.extend(extra.iter().cloned());
            }
            Some(restricted)
        }
        None if saw_wildcard => Some(set([WILDCARD])),
        None => None,
    };

    ToolPolicy {
        allow,
        deny,
        also_allow,
    }
}

/// Effective policy for a job on `channel`.
///
/// `layers` are the skill, plugin and agent policies in that order. The
/// channel baseline is widened by the note tools when the channel accepts them
/// and the layers do not already allow everything.
pub fn resolve_effective_policy(channel: ChannelKind, layers: &[ToolPolicy]) -> ToolPolicy {
    let merged = merge_tool_policies(layers);
    let with_notes = channel.includes_note_tools() && !merged.is_allow_all();
    let baseline = channel.baseline_policy(with_notes);
    merge_tool_policies(&[baseline, merged])
}
