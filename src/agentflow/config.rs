//! Ambient process configuration.
//!
//! Per `config.rs`'s explicit stance ("no TOML, YAML, or other config-file parsing
//! dependency"), this stays a plain struct with a `Default` impl and `with_*` builders,
//! constructible from environment variables or caller-supplied literals. Per-request
//! tuning (`OrchestrationConfig`, `EvaluationCriteria`, `RetryConfig`) lives in
//! [`super::types`]; this module covers process-wide defaults that apply before any
//! request exists, most notably the per-[`super::types::AgentKind`] timeout table
//! (spec §4.5 step 2).

use std::collections::HashMap;

use super::types::AgentKind;

/// Fallback per-agent-kind timeout applied when neither a subtask override nor a
/// config override is present (spec §4.5).
pub fn default_timeout_secs(kind: AgentKind) -> u64 {
    match kind {
        AgentKind::Rag => 120,
        AgentKind::Ims => 180,
        AgentKind::Vision => 90,
        AgentKind::Code => 180,
        AgentKind::Planner => 60,
    }
}

/// Timeout used when a kind somehow falls outside the table above (defensive only;
/// [`AgentKind`] is closed so this should never trigger in practice).
pub const FALLBACK_TIMEOUT_SECS: u64 = 300;

/// Overall request timeout default (spec §5 "context.timeout, default 300s").
pub const DEFAULT_REQUEST_TIMEOUT_SECS: i64 = 300;

/// Reason-Act loop default/hard-cap step budget (spec §4.6).
pub const DEFAULT_MAX_STEPS: usize = 10;
pub const HARD_CAP_MAX_STEPS: usize = 50;

/// Doom-loop guard window (spec §4.6).
pub const DOOM_LOOP_THRESHOLD: usize = 3;

/// Process-wide runtime configuration: everything read once at startup rather than
/// per-request, e.g. whether an LLM-assisted tier is enabled and the app's error
/// rendering mode.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub app_mode: super::errors::AppMode,
    pub llm_tiers_enabled: bool,
    pub timeout_overrides: HashMap<AgentKind, u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            app_mode: super::errors::AppMode::Production,
            llm_tiers_enabled: true,
            timeout_overrides: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn development() -> Self {
        Self { app_mode: super::errors::AppMode::Development, ..Self::default() }
    }

    pub fn with_llm_tiers_enabled(mut self, enabled: bool) -> Self {
        self.llm_tiers_enabled = enabled;
        self
    }

    pub fn with_timeout_override(mut self, kind: AgentKind, seconds: u64) -> Self {
        self.timeout_overrides.insert(kind, seconds);
        self
    }

    /// Resolve a subtask's timeout: explicit override wins, then this process's
    /// override table, then the per-kind default, then the global fallback.
    pub fn resolve_timeout(&self, kind: AgentKind, subtask_override: Option<u64>) -> u64 {
        subtask_override
            .or_else(|| self.timeout_overrides.get(&kind).copied())
            .unwrap_or_else(|| default_timeout_secs(kind))
    }
}

/// Initialize process-wide logging the way the rest of the ambient stack does it:
/// `env_logger` wired up once, idempotently, in binaries/examples/tests.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(cfg!(test)).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_table_matches_the_spec_defaults() {
        assert_eq!(default_timeout_secs(AgentKind::Rag), 120);
        assert_eq!(default_timeout_secs(AgentKind::Ims), 180);
        assert_eq!(default_timeout_secs(AgentKind::Vision), 90);
        assert_eq!(default_timeout_secs(AgentKind::Code), 180);
        assert_eq!(default_timeout_secs(AgentKind::Planner), 60);
    }

    #[test]
    fn subtask_override_wins_over_config_and_default() {
        let config = RuntimeConfig::default().with_timeout_override(AgentKind::Rag, 45);
        assert_eq!(config.resolve_timeout(AgentKind::Rag, Some(5)), 5);
        assert_eq!(config.resolve_timeout(AgentKind::Rag, None), 45);
        assert_eq!(config.resolve_timeout(AgentKind::Vision, None), 90);
    }
}
