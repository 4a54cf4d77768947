//! Error taxonomy (spec §7).
//!
//! Each fallible component defines values for its own recoverable conditions
//! (`ToolResult`, `EvaluationResult`, `AgentResult::success=false`) rather than
//! returning an error; [`OrchestratorError`] exists only for conditions that abort
//! the request itself (validation, internal failure) rather than degrade a subtask.

use std::fmt;

/// Whether error rendering includes internal detail (spec §7 "User-visible failure
/// behavior").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Development,
    Production,
}

/// Request-level failure kinds. Subtask-level failures never reach this type; they
/// stay inside `AgentResult`/`SubTask` so a single bad subtask cannot abort a request.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    /// Malformed request or unknown agent kind.
    Validation { message: String },
    /// The DAG builder produced an invalid graph and no fallback was possible.
    InvalidDag { message: String },
    /// Something failed in a way no taxonomy kind above captures.
    Internal { message: String, request_id: String },
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        OrchestratorError::Validation { message: message.into() }
    }

    pub fn internal(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        OrchestratorError::Internal {
            message: message.into(),
            request_id: request_id.into(),
        }
    }

    /// Render this error for the caller, gated by `mode` so production responses never
    /// leak internal detail.
    pub fn render(&self, mode: AppMode) -> String {
        match (self, mode) {
            (OrchestratorError::Validation { message }, AppMode::Development) => {
                format!("validation error: {message}")
            }
            (OrchestratorError::Validation { .. }, AppMode::Production) => {
                "the request could not be understood. please rephrase.".to_string()
            }
            (OrchestratorError::InvalidDag { message }, AppMode::Development) => {
                format!("task decomposition failed: {message}")
            }
            (OrchestratorError::InvalidDag { .. }, AppMode::Production) => {
                "the task could not be planned. please try a simpler phrasing.".to_string()
            }
            (OrchestratorError::Internal { message, request_id }, AppMode::Development) => {
                format!("internal error (request {request_id}): {message}")
            }
            (OrchestratorError::Internal { request_id, .. }, AppMode::Production) => {
                format!("something went wrong. reference id: {request_id}")
            }
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(AppMode::Development).fmt(f)
    }
}

impl std::error::Error for OrchestratorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_mode_hides_message_detail() {
        let err = OrchestratorError::internal("panic in synthesis step", "req-42");
        let rendered = err.render(AppMode::Production);
        assert!(!rendered.contains("panic"));
        assert!(rendered.contains("req-42"));
    }

    #[test]
    fn development_mode_includes_message() {
        let err = OrchestratorError::validation("missing task text");
        assert!(err.render(AppMode::Development).contains("missing task text"));
    }
}
