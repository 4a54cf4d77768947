//! Agent Registry (spec §4.5 in the component table: "Agent-kind → agent-instance map,
//! prompt/tool configuration").
//!
//! Grounded on `agent.rs`'s builder-style `Agent` construction, narrowed from an
//! arbitrary string-identified agent down to a closed-enum-keyed map per the design
//! notes' "prefer a sum type for agent kinds" guidance.

use std::collections::HashMap;
use std::sync::Arc;

use super::tool_registry::{default_tools_for, Tool, ToolRegistry};
use super::types::AgentKind;

/// A system prompt plus the resolved tool allowlist for one [`AgentKind`].
pub struct AgentProfile {
    pub kind: AgentKind,
    pub system_prompt: String,
    pub tools: Vec<Arc<Tool>>,
}

fn default_system_prompt(kind: AgentKind) -> String {
    match kind {
        AgentKind::Rag => {
            "You are a retrieval-augmented assistant. Ground every answer in the results \
             of your vector_search, graph_query, and document_read tools, and cite sources."
                .to_string()
        }
        AgentKind::Ims => {
            "You are an issue-management assistant. Use ims_search, web_fetch, and \
             vector_search to find and summarize relevant tickets."
                .to_string()
        }
        AgentKind::Vision => {
            "You are a document-and-image analysis assistant. Use document_read and \
             vector_search to ground your description of visual or document content."
                .to_string()
        }
        AgentKind::Code => {
            "You are a coding assistant. Use document_read and vector_search to gather \
             context, and shell only for commands the user clearly intends to run."
                .to_string()
        }
        AgentKind::Planner => {
            "You are a planning assistant. Use vector_search, graph_query, ims_search, \
             and document_read to gather the facts a plan depends on."
                .to_string()
        }
    }
}

/// Agent-kind keyed map of profiles, built once at startup from a [`ToolRegistry`] and
/// treated as read-only thereafter (spec §5).
pub struct AgentRegistry {
    profiles: HashMap<AgentKind, AgentProfile>,
}

impl AgentRegistry {
    /// Build one profile per [`AgentKind`], with the tools the registry actually has
    /// registered for that kind's default allowlist.
    pub fn from_tool_registry(tool_registry: &ToolRegistry) -> Self {
        let mut profiles = HashMap::new();
        for kind in AgentKind::ALL {
            let tools = tool_registry.list_for_agent_kind(kind);
            profiles.insert(
                kind,
                AgentProfile { kind, system_prompt: default_system_prompt(kind), tools },
            );
        }
        Self { profiles }
    }

    pub fn get(&self, kind: AgentKind) -> &AgentProfile {
        self.profiles
            .get(&kind)
            .unwrap_or_else(|| panic!("agent registry missing a profile for {kind}; AgentKind::ALL is exhaustive"))
    }

    /// Used by `list_agent_kinds()` (spec §6).
    pub fn list(&self) -> impl Iterator<Item = &AgentProfile> {
        AgentKind::ALL.iter().filter_map(move |k| self.profiles.get(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::tools::populate_default_registry;

    #[test]
    fn every_agent_kind_has_a_profile_with_its_default_tools() {
        let mut registry = ToolRegistry::new();
        populate_default_registry(&mut registry);
        let agents = AgentRegistry::from_tool_registry(&registry);
        for kind in AgentKind::ALL {
            let profile = agents.get(kind);
            assert_eq!(profile.tools.len(), default_tools_for(kind).len());
            assert!(!profile.system_prompt.is_empty());
        }
    }
}
