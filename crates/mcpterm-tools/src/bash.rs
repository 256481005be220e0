// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::guard::{wrap_sudo, CommandGuard};

/// Combined stdout+stderr is truncated beyond this size before being handed
/// back to the model.
pub const MAX_OUTPUT_BYTES: usize = 100_000;

/// Tool schema as exposed to the model.  Mirrors the model crate's
/// `ToolSchema` shape but keeps this crate independent from it.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The result of one bash invocation (or refusal).
#[derive(Debug, Clone)]
pub struct BashOutcome {
    /// The command as actually executed (after sudo wrapping), or as
    /// requested when it was blocked.
    pub command: String,
    pub output: String,
    pub success: bool,
    pub truncated: bool,
    /// True when the blocklist refused the command; no process was spawned.
    pub blocked: bool,
    pub duration_ms: u64,
}

/// The single tool exposed to the model: run a bash command with a timeout.
pub struct BashTool {
    default_timeout: Duration,
    guard: CommandGuard,
}

impl BashTool {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            default_timeout: Duration::from_millis(timeout_ms),
            guard: CommandGuard::new(),
        }
    }

    /// The schema advertised to the model.  The description explicitly
    /// invites parallel calls within one turn — independent inspections
    /// (disk, services, logs) should not be serialized.
    pub fn spec() -> ToolSpec {
        ToolSpec {
            name: "bash".into(),
            description: "Execute a bash command on this machine and return its output.\n\n\
                 Use this to inspect the system: disk usage, services, logs, \
                 network, processes, containers, firewall state.\n\n\
                 When several independent commands are needed, issue multiple \
                 bash calls in the SAME turn — they run in parallel and reduce \
                 latency. Chain dependent commands with '&&' in a single call.\n\n\
                 Output is limited to 100,000 bytes and truncated beyond that. \
                 The default timeout is 30 seconds; pass `timeout` (seconds) \
                 for slow commands. Destructive commands (rm -rf /, raw writes \
                 to block devices, mkfs) are refused."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The bash command to execute"
                    },
                    "description": {
                        "type": "string",
                        "description": "One line describing what the command checks (optional)"
                    },
                    "timeout": {
                        "type": "integer",
                        "description": "Execution timeout in seconds (optional)"
                    }
                },
                "required": ["command"],
                "additionalProperties": false
            }),
        }
    }

    /// Execute `command`, applying the blocklist and sudo wrapping first.
    ///
    /// A blocked command returns `blocked=true, success=false` without
    /// spawning any process.
    pub async fn execute(&self, command: &str, timeout_secs: Option<u64>) -> BashOutcome {
        if let Some(reason) = self.guard.check(command) {
            debug!(cmd = %command, reason, "bash command blocked");
            return BashOutcome {
                command: command.to_string(),
                output: format!("command refused by safety blocklist: {reason}"),
                success: false,
                truncated: false,
                blocked: true,
                duration_ms: 0,
            };
        }

        let effective = wrap_sudo(command);
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        debug!(cmd = %effective, timeout_secs = timeout.as_secs(), "bash tool");

        let start = Instant::now();
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&effective).kill_on_drop(true);

        let result = tokio::time::timeout(timeout, cmd.output()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stdout.is_empty() {
                    content.push_str(&stdout);
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&stderr);
                }
                if content.is_empty() {
                    content = format!("[exit {}]", output.status.code().unwrap_or(-1));
                }
                let truncated = content.len() > MAX_OUTPUT_BYTES;
                if truncated {
                    content = truncate_output(&content, MAX_OUTPUT_BYTES);
                }
                BashOutcome {
                    command: effective,
                    output: content,
                    success: output.status.success(),
                    truncated,
                    blocked: false,
                    duration_ms,
                }
            }
            Ok(Err(e)) => BashOutcome {
                command: effective,
                output: format!("spawn error: {e}"),
                success: false,
                truncated: false,
                blocked: false,
                duration_ms,
            },
            Err(_) => BashOutcome {
                command: effective,
                output: format!("timeout after {}s", timeout.as_secs()),
                success: false,
                truncated: false,
                blocked: false,
                duration_ms,
            },
        }
    }
}

fn truncate_output(s: &str, limit: usize) -> String {
    let mut cut = limit;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...[truncated {} bytes]", &s[..cut], s.len() - cut)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> BashTool {
        BashTool::new(30_000)
    }

    #[tokio::test]
    async fn executes_echo_and_returns_stdout() {
        let out = tool().execute("echo hello", None).await;
        assert!(out.success);
        assert!(!out.blocked);
        assert!(out.output.contains("hello"));
    }

    #[tokio::test]
    async fn captures_stderr() {
        let out = tool().execute("echo err >&2", None).await;
        assert!(out.output.contains("err"));
        assert!(out.output.contains("[stderr]"));
    }

    #[tokio::test]
    async fn non_zero_exit_reports_failure() {
        let out = tool().execute("exit 3", None).await;
        assert!(!out.success);
        assert!(!out.blocked);
    }

    #[tokio::test]
    async fn blocked_command_spawns_no_process() {
        let out = tool().execute("rm -rf /", None).await;
        assert!(out.blocked);
        assert!(!out.success);
        assert!(out.output.contains("blocklist"));
        assert_eq!(out.duration_ms, 0);
    }

    #[tokio::test]
    async fn timeout_returns_error() {
        let t = BashTool::new(100);
        let out = t.execute("sleep 5", None).await;
        assert!(!out.success);
        assert!(out.output.contains("timeout"));
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_and_flagged() {
        // `yes` capped by head produces far more than the limit.
        let out = tool()
            .execute("head -c 200000 /dev/zero | tr '\\0' 'x'", None)
            .await;
        assert!(out.truncated);
        assert!(out.output.len() <= MAX_OUTPUT_BYTES + 64);
        assert!(out.output.contains("truncated"));
    }

    #[test]
    fn spec_declares_single_required_command_argument() {
        let spec = BashTool::spec();
        assert_eq!(spec.name, "bash");
        assert_eq!(spec.parameters["required"][0], "command");
        assert!(spec.description.contains("parallel"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo".repeat(100);
        let t = truncate_output(&s, 7);
        assert!(t.starts_with("héll") || t.starts_with("hé"));
    }
}
