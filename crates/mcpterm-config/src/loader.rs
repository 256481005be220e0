// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Default location of the config file: `~/.mcp-terminal/config.json`.
pub fn config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-terminal")
        .join("config.json")
}

/// Load configuration from `extra` (e.g. a `--config` flag) or the default
/// path, falling back to built-in defaults when no file exists.
///
/// A file that exists but does not parse is a hard error — silently running
/// with defaults when the user has a broken config would mask the mistake.
/// Environment overrides (`MCP_USER`, `ANTHROPIC_API_KEY`, `DEBUG`) are
/// applied last.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let path = extra.map(Path::to_path_buf).unwrap_or_else(config_path);

    let mut config = if path.is_file() {
        debug!(path = %path.display(), "loading config");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?
    } else if extra.is_some() {
        anyhow::bail!("config file not found: {}", path.display());
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(user) = std::env::var("MCP_USER") {
        if !user.is_empty() {
            config.user = Some(user);
        }
    }
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        if !key.is_empty() {
            config.anthropic_api_key = Some(key);
        }
    }
    if std::env::var("DEBUG").is_ok_and(|v| !v.is_empty() && v != "0") {
        config.debug = true;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
