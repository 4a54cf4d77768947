//! Shell tool (spec §6: `run(command, timeout, working_dir) → {command, exit_code,
//! stdout, stderr}` with deny-list enforcement), grounded directly on `tools/bash.rs`'s
//! `BashTool`: same denylist-beats-allowlist matching, the same stdout/stderr size cap,
//! and the same `tokio::process::Command` + `tokio::time::timeout` execution shape.
//! The permission-level gate for dangerous commands lives in
//! [`crate::agentflow::permissions`]; this tool's own denylist is a second,
//! defense-in-depth layer the spec expects every tool to enforce independently.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

use crate::agentflow::tool_registry::ToolProtocol;
use crate::agentflow::types::{AgentContext, ToolResult};

/// Per-stream output cap (spec §4.1: "10 kB stdout").
pub const MAX_OUTPUT_SIZE: usize = 10 * 1024;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Command prefixes this tool refuses to run regardless of the permission manager's
/// verdict.
const DENIED_PREFIXES: &[&str] = &["rm -rf", "sudo", "mkfs", "dd if=", ":(){ :|:& };:"];

async fn read_limited<R: AsyncReadExt + Unpin>(mut reader: R, max_bytes: usize) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max_bytes.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
                if buf.len() >= max_bytes {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn is_denied(command: &str) -> bool {
    let lower = command.trim().to_lowercase();
    DENIED_PREFIXES.iter().any(|denied| lower.starts_with(denied) || lower.contains(denied))
}

pub struct ShellTool;

impl ShellTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for ShellTool {
    async fn execute(&self, _ctx: &AgentContext, arguments: HashMap<String, Value>) -> ToolResult {
        let command = match arguments.get("command").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolResult::failure("missing required field 'command'"),
        };
        if is_denied(command) {
            return ToolResult::failure(format!("command denied by shell tool deny-list: {command}"));
        }
        let timeout_secs = arguments.get("timeout").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_TIMEOUT_SECS);
        let working_dir = arguments.get("working_dir").and_then(|v| v.as_str());

        let mut cmd = TokioCommand::new("/bin/bash");
        cmd.arg("-c").arg(command).stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::piped());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolResult::failure(format!("failed to spawn shell: {e}")),
        };
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let run = async {
            let (stdout, stderr) = tokio::join!(
                async { if let Some(p) = stdout_pipe { read_limited(p, MAX_OUTPUT_SIZE).await } else { String::new() } },
                async { if let Some(p) = stderr_pipe { read_limited(p, MAX_OUTPUT_SIZE).await } else { String::new() } },
            );
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        let (stdout, stderr, status) = match tokio::time::timeout(Duration::from_secs(timeout_secs), run).await {
            Ok(outcome) => outcome,
            Err(_) => return ToolResult::failure(format!("command timed out after {timeout_secs}s")),
        };

        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => return ToolResult::failure(format!("failed to wait on shell process: {e}")),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let body = serde_json::json!({
            "command": command,
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "duration_ms": duration_ms,
        });
        if exit_code == 0 {
            ToolResult::success(body.to_string())
        } else {
            ToolResult { success: false, output: body.to_string(), error: Some(format!("exit code {exit_code}")), metadata: None }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denylist_matches_dangerous_prefixes() {
        assert!(is_denied("rm -rf /"));
        assert!(is_denied("sudo reboot"));
        assert!(!is_denied("ls -la /tmp"));
    }

    #[tokio::test]
    async fn denied_command_is_never_spawned() {
        let tool = ShellTool::new();
        let ctx = AgentContext::new("sess", 10, 300);
        let mut args = HashMap::new();
        args.insert("command".to_string(), Value::String("rm -rf /".to_string()));
        let result = tool.execute(&ctx, args).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("denied"));
    }

    #[tokio::test]
    async fn successful_command_captures_stdout() {
        let tool = ShellTool::new();
        let ctx = AgentContext::new("sess", 10, 300);
        let mut args = HashMap::new();
        args.insert("command".to_string(), Value::String("echo hello".to_string()));
        let result = tool.execute(&ctx, args).await;
        assert!(result.success);
        assert!(result.output.contains("hello"));
    }
}
