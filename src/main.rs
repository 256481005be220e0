// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossterm::execute;
use crossterm::event::{DisableBracketedPaste, EnableBracketedPaste};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use mcpterm_core::{system_prompt, History, Orchestrator, OrchestratorConfig};
use mcpterm_model::{AnthropicProvider, ModelProvider};
use mcpterm_store::{LocalStore, MachineInfo, RemoteStore, SessionRow, StoreError, SyncWorker};
use mcpterm_tools::BashTool;
use mcpterm_tui::{App, AppOptions};

#[derive(Parser, Debug)]
#[command(name = "mcpterm", about = "Interactive terminal assistant", version)]
struct Cli {
    /// Path to an alternate config file (default: ~/.mcp-terminal/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Username whose history partition to use (overrides config and MCP_USER)
    #[arg(long)]
    user: Option<String>,

    /// Verbose logging to stderr (only useful when not attached to a TTY)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // In raw mode stderr output corrupts the display, so tracing stays
    // silent unless a log file is configured or the caller opted in.
    init_logging(cli.verbose);

    let mut config = mcpterm_config::load(cli.config.as_deref())?;
    if let Some(user) = &cli.user {
        config.user = Some(user.clone());
    }

    run(config).await
}

async fn run(config: mcpterm_config::Config) -> anyhow::Result<()> {
    // 1. Model provider.
    let model: Arc<dyn ModelProvider> = match config.ai_provider.as_str() {
        "claude" => Arc::new(AnthropicProvider::new(
            config.claude_model.clone(),
            config.anthropic_api_key.clone(),
            config.max_tokens,
            config.temperature,
        )),
        other => anyhow::bail!("unknown ai_provider '{other}' (supported: claude)"),
    };

    // 2. Local store, then identity.  Local DB trouble here is fatal.
    let db_path = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-terminal")
        .join("cache.db");
    let store =
        Arc::new(LocalStore::open(&db_path).context("opening local history database")?);

    let remote = if config.remote_configured() {
        let r = Arc::new(RemoteStore::new(
            config.turso_url.clone().unwrap_or_default(),
            config.turso_token.clone().unwrap_or_default(),
        ));
        if let Err(e) = r.ensure_schema().await {
            // Offline mode: history stays local, the sync worker retries.
            warn!("remote schema check failed, continuing offline: {e}");
        }
        Some(r)
    } else {
        None
    };

    // 3. Resolve username → user id.  An unknown user is fatal before any
    // UI starts; the error text is propagated verbatim.
    let user_id = match &config.user {
        None => None,
        Some(username) => Some(resolve_user(&store, remote.as_deref(), username).await?),
    };

    // 4. Machine registration.
    let machine_id = derive_machine_id();
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    let os_info = read_os_info();
    let now = chrono::Utc::now().timestamp();
    store.register_machine(&MachineInfo {
        machine_id: machine_id.clone(),
        hostname: hostname.clone(),
        ip: None,
        os_info: os_info.clone(),
        first_seen: now,
        last_seen: now,
        total_commands: 0,
    })?;

    // 5. Session.
    let session_id = uuid::Uuid::new_v4().to_string();
    store.open_session(&SessionRow {
        id: session_id.clone(),
        machine_id: machine_id.clone(),
        user_id,
        started_at: now,
        ended_at: None,
        command_count: 0,
    })?;

    // 6. Background sync worker (remote mode only).
    let sync_cancel = CancellationToken::new();
    let (sync_handle, sync_task) = match &remote {
        Some(r) => {
            let worker = SyncWorker::new(
                Arc::clone(&store),
                Arc::clone(r) as Arc<dyn mcpterm_store::RemoteApi>,
                user_id,
                machine_id.clone(),
                Duration::from_secs(config.sync_interval_secs),
            );
            let handle = worker.handle();
            let task = tokio::spawn(worker.run(sync_cancel.clone()));
            (Some(handle), Some(task))
        }
        None => (None, None),
    };

    // 7. Orchestrator.
    let bash = config
        .tools_enabled()
        .then(|| BashTool::new(config.bash_config.timeout));
    let host_context = format!("hostname: {hostname}\nos: {os_info}");
    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::clone(&model),
            bash,
            OrchestratorConfig {
                max_iterations: config.max_iterations,
                max_execution_time: Duration::from_secs(config.max_execution_time_secs),
                max_tokens: config.max_tokens,
                temperature: config.temperature,
            },
            system_prompt(Some(&host_context)),
        )
        .with_cache(Arc::clone(&store), machine_id.clone()),
    );

    // 8. Interaction loop.
    let history = History::new(Arc::clone(&store), user_id, &machine_id, &session_id)?;
    let options = AppOptions {
        min_compact_messages: config.min_compact_messages,
        max_tokens: config.max_tokens,
        debug: config.debug,
        provider_label: format!("{}/{}", model.name(), model.model_name()),
    };
    let mut app = App::new(history, orchestrator, Arc::clone(&model), sync_handle, options);

    let raw_guard = RawModeGuard::enable_if_tty()?;
    let result = app.run().await;
    drop(raw_guard);

    // Give the sync worker one chance to flush, then stop it.
    sync_cancel.cancel();
    if let Some(task) = sync_task {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    result
}

/// Username → id, local mirror first, then the remote users table.
/// A username that exists nowhere fails startup with `USER_NOT_FOUND`.
async fn resolve_user(
    store: &LocalStore,
    remote: Option<&RemoteStore>,
    username: &str,
) -> anyhow::Result<i64> {
    if let Some(user) = store.resolve_user(username)? {
        return Ok(user.id);
    }
    if let Some(remote) = remote {
        match remote.fetch_user(username).await {
            Ok(Some(user)) => {
                store.upsert_user(&user)?;
                return Ok(user.id);
            }
            Ok(None) => {}
            Err(e) => warn!("remote user lookup failed: {e}"),
        }
    }
    Err(StoreError::UserNotFound(username.to_string()).into())
}

/// Stable machine identity: hash of /etc/machine-id, hostname fallback.
fn derive_machine_id() -> String {
    let seed = std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown-machine".into())
        });
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

fn read_os_info() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|text| {
            text.lines()
                .find_map(|l| l.strip_prefix("PRETTY_NAME=").map(str::to_string))
        })
        .map(|s| s.trim_matches('"').to_string())
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}

fn init_logging(verbose: bool) {
    let stdout_is_tty = io::stdout().is_terminal();
    if let Ok(path) = std::env::var("MCPTERM_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .init();
        }
        return;
    }
    if verbose && !stdout_is_tty {
        tracing_subscriber::registry()
            .with(EnvFilter::new("debug"))
            .with(fmt::layer().with_writer(io::stderr))
            .init();
    }
}

/// The only process-wide state: terminal raw mode, restored on every exit
/// path through Drop.
struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    fn enable_if_tty() -> anyhow::Result<Self> {
        if !io::stdout().is_terminal() {
            return Ok(Self { active: false });
        }
        crossterm::terminal::enable_raw_mode().context("enabling raw mode")?;
        execute!(io::stdout(), EnableBracketedPaste).context("enabling bracketed paste")?;
        Ok(Self { active: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = execute!(io::stdout(), DisableBracketedPaste);
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_stable_and_short() {
        let a = derive_machine_id();
        let b = derive_machine_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn os_info_is_never_empty() {
        assert!(!read_os_info().is_empty());
    }

    #[tokio::test]
    async fn unknown_user_fails_with_user_not_found() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = resolve_user(&store, None, "ghost").await.unwrap_err();
        assert!(err.to_string().contains("USER_NOT_FOUND"));
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn known_local_user_resolves() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .upsert_user(&mcpterm_store::UserRow {
                id: 42,
                username: "fabio".into(),
                display_name: "Fabio".into(),
                email: None,
                created_at: 1,
                active: true,
            })
            .unwrap();
        let id = resolve_user(&store, None, "fabio").await.unwrap();
        assert_eq!(id, 42);
    }
}
