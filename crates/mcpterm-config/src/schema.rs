// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

fn default_provider() -> String {
    "claude".into()
}

fn default_model() -> String {
    "claude-sonnet-4-5".into()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_bash_timeout_ms() -> u64 {
    30_000
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_execution_secs() -> u64 {
    60
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_min_compact_messages() -> usize {
    10
}

/// User-facing configuration, read from `~/.mcp-terminal/config.json`.
///
/// Every field has a built-in default so a missing or empty config file is
/// valid.  Unknown keys are ignored so older binaries tolerate newer files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// AI provider identifier.  Only "claude" is built in; "mock" is
    /// available for tests.
    #[serde(default = "default_provider")]
    pub ai_provider: String,

    /// API key for the Anthropic API.  The ANTHROPIC_API_KEY environment
    /// variable takes precedence when set.
    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    /// Model name forwarded to the provider API.
    #[serde(default = "default_model")]
    pub claude_model: String,

    /// Enable native provider tool calls.
    #[serde(default)]
    pub use_native_tools: bool,

    /// Expose the `bash` tool to the model, activating the agentic loop.
    #[serde(default)]
    pub enable_bash_tool: bool,

    /// Maximum tokens to request in a single completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature (0.0–1.0).
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, rename = "bashConfig")]
    pub bash_config: BashConfig,

    /// Verbose logging.  The DEBUG environment variable also enables this.
    #[serde(default)]
    pub debug: bool,

    /// Username whose history partition this terminal writes to.
    /// Overridden by the MCP_USER environment variable.
    #[serde(default)]
    pub user: Option<String>,

    /// Turso-compatible remote database URL.  When absent the terminal runs
    /// in local-only mode and the sync worker is not started.
    #[serde(default)]
    pub turso_url: Option<String>,

    /// Auth token for the remote database.
    #[serde(default)]
    pub turso_token: Option<String>,

    /// Maximum model↔tool rounds per turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock budget for one turn, in seconds.
    #[serde(default = "default_max_execution_secs")]
    pub max_execution_time_secs: u64,

    /// Period of the background sync worker, in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Minimum buffer entries before `/compact` is accepted.
    #[serde(default = "default_min_compact_messages")]
    pub min_compact_messages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ai_provider: default_provider(),
            anthropic_api_key: None,
            claude_model: default_model(),
            use_native_tools: false,
            enable_bash_tool: false,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            bash_config: BashConfig::default(),
            debug: false,
            user: None,
            turso_url: None,
            turso_token: None,
            max_iterations: default_max_iterations(),
            max_execution_time_secs: default_max_execution_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            min_compact_messages: default_min_compact_messages(),
        }
    }
}

impl Config {
    /// True when the orchestrator should expose the `bash` tool.
    pub fn tools_enabled(&self) -> bool {
        self.use_native_tools || self.enable_bash_tool
    }

    /// True when a remote database is configured.
    pub fn remote_configured(&self) -> bool {
        self.turso_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Settings for the `bash` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BashConfig {
    /// Per-command timeout in milliseconds.
    #[serde(default = "default_bash_timeout_ms")]
    pub timeout: u64,
}

impl Default for BashConfig {
    fn default() -> Self {
        Self { timeout: default_bash_timeout_ms() }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
