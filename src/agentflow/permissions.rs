//! Permission Manager (spec §4.2).
//!
//! Evaluates `(tool, agent kind, user, resource)` against an ordered per-kind rule
//! list with first-match-wins semantics, a default action when nothing matches, an
//! admin bypass, and per-user overrides that take precedence over the per-kind table.
//! Grounded on `original_source/app/api/agents/permissions.py`'s `DEFAULT_AGENT_PERMISSIONS`
//! shape and on `tools/bash.rs`'s allow/deny glob matching for the pattern primitive.

use std::collections::{HashMap, HashSet};

use super::types::AgentKind;

/// The verdict a [`Rule`] or default action carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
    /// Treated as [`Action::Deny`] in this crate's non-interactive mode (spec §4.2).
    Ask,
}

impl Action {
    /// Resolve `Ask` down to `Deny` for a non-interactive caller.
    fn resolved(self) -> bool {
        matches!(self, Action::Allow)
    }
}

/// One ordered entry in an agent kind's rule list.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Exact tool name, or `"*"` to match any tool.
    pub tool_pattern: String,
    /// A glob resource pattern (`*` and `?` wildcards), matched against the resource
    /// string a caller supplies (e.g. a shell command or URL).
    pub resource_pattern: String,
    pub action: Action,
}

impl Rule {
    pub fn new(tool_pattern: impl Into<String>, resource_pattern: impl Into<String>, action: Action) -> Self {
        Self {
            tool_pattern: tool_pattern.into(),
            resource_pattern: resource_pattern.into(),
            action,
        }
    }

    fn matches(&self, tool_name: &str, resource: &str) -> bool {
        (self.tool_pattern == "*" || self.tool_pattern == tool_name) && glob_match(&self.resource_pattern, resource)
    }
}

/// Minimal `*`/`?` glob matcher, sufficient for the resource patterns this crate needs
/// (no character classes or brace expansion).
fn glob_match(pattern: &str, text: &str) -> bool {
    fn helper(pattern: &[char], text: &[char]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some('*') => {
                (0..=text.len()).any(|i| helper(&pattern[1..], &text[i..]))
            }
            Some('?') => !text.is_empty() && helper(&pattern[1..], &text[1..]),
            Some(c) => !text.is_empty() && *c == text[0] && helper(&pattern[1..], &text[1..]),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    helper(&p, &t)
}

/// Rule-based access control for `(tool, agent kind, user, resource)` triples.
pub struct PermissionManager {
    rules: HashMap<AgentKind, Vec<Rule>>,
    default_actions: HashMap<AgentKind, Action>,
    admins: HashSet<String>,
    /// Per-user overrides, consulted before the per-kind table.
    user_overrides: HashMap<String, Vec<Rule>>,
}

impl PermissionManager {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            default_actions: HashMap::new(),
            admins: HashSet::new(),
            user_overrides: HashMap::new(),
        }
    }

    /// Build the default tables: each kind allows its own assigned tools against any
    /// resource and denies everything else by default, with the Code agent's `shell`
    /// tool additionally restricted to a handful of interpreter/package-manager prefixes
    /// (spec §4.2's concrete non-`*` resource-pattern example).
    pub fn with_defaults() -> Self {
        let mut manager = Self::new();
        for kind in AgentKind::ALL {
            let mut rules: Vec<Rule> = super::tool_registry::default_tools_for(kind)
                .iter()
                .map(|tool| Rule::new(*tool, "*", Action::Allow))
                .collect();
            if kind == AgentKind::Code {
                rules.retain(|r| r.tool_pattern != "shell");
                rules.push(Rule::new("shell", "python*", Action::Allow));
                rules.push(Rule::new("shell", "node*", Action::Allow));
                rules.push(Rule::new("shell", "npm*", Action::Allow));
                rules.push(Rule::new("shell", "*.py", Action::Allow));
                rules.push(Rule::new("shell", "*", Action::Deny));
            }
            manager.rules.insert(kind, rules);
            manager.default_actions.insert(kind, Action::Deny);
        }
        manager
    }

    pub fn add_admin(&mut self, user_id: impl Into<String>) {
        self.admins.insert(user_id.into());
    }

    pub fn set_user_override(&mut self, user_id: impl Into<String>, rules: Vec<Rule>) {
        self.user_overrides.insert(user_id.into(), rules);
    }

    /// Evaluate whether `user_id` acting as `agent_kind` may invoke `tool_name` against
    /// `resource`. Admins bypass every rule; a per-user override (if present) is
    /// evaluated before the per-kind table; first matching rule wins; if nothing
    /// matches, the agent kind's default action applies.
    pub fn check(&self, tool_name: &str, agent_kind: AgentKind, user_id: Option<&str>, resource: &str) -> bool {
        if let Some(user_id) = user_id {
            if self.admins.contains(user_id) {
                return true;
            }
            if let Some(overrides) = self.user_overrides.get(user_id) {
                if let Some(rule) = overrides.iter().find(|r| r.matches(tool_name, resource)) {
                    return rule.action.resolved();
                }
            }
        }
        if let Some(rules) = self.rules.get(&agent_kind) {
            if let Some(rule) = rules.iter().find(|r| r.matches(tool_name, resource)) {
                return rule.action.resolved();
            }
        }
        self.default_actions.get(&agent_kind).copied().unwrap_or(Action::Deny).resolved()
    }
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_prefix_and_suffix_wildcards() {
        assert!(glob_match("python*", "python3 script.py"));
        assert!(glob_match("*.py", "run.py"));
        assert!(!glob_match("*.py", "run.sh"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn default_table_allows_assigned_tools_and_denies_others() {
        let manager = PermissionManager::with_defaults();
        assert!(manager.check("vector_search", AgentKind::Rag, None, "*"));
        assert!(!manager.check("shell", AgentKind::Rag, None, "*"));
    }

    #[test]
    fn code_agent_shell_is_resource_restricted() {
        let manager = PermissionManager::with_defaults();
        assert!(manager.check("shell", AgentKind::Code, None, "python3 train.py"));
        assert!(!manager.check("shell", AgentKind::Code, None, "rm -rf /"));
    }

    #[test]
    fn admin_bypasses_every_rule() {
        let mut manager = PermissionManager::with_defaults();
        manager.add_admin("root-user");
        assert!(manager.check("shell", AgentKind::Rag, Some("root-user"), "rm -rf /"));
    }

    #[test]
    fn per_user_override_takes_precedence() {
        let mut manager = PermissionManager::with_defaults();
        manager.set_user_override("vip", vec![Rule::new("shell", "*", Action::Allow)]);
        assert!(manager.check("shell", AgentKind::Rag, Some("vip"), "anything"));
        assert!(!manager.check("shell", AgentKind::Rag, Some("other-user"), "anything"));
    }

    #[test]
    fn ask_is_treated_as_deny_non_interactively() {
        let mut manager = PermissionManager::new();
        manager.rules.insert(AgentKind::Code, vec![Rule::new("*", "*", Action::Ask)]);
        manager.default_actions.insert(AgentKind::Code, Action::Deny);
        assert!(!manager.check("shell", AgentKind::Code, None, "*"));
    }
}
