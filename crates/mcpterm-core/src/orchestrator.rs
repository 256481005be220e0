// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agentic orchestrator: a bounded model ↔ bash loop that turns a
//! natural-language question into a synthesized answer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mcpterm_model::{
    CompletionRequest, ContentBlock, Message, ModelError, ModelProvider, ResponseEvent, Role,
    StopReason, ToolChoice, ToolSchema,
};
use mcpterm_store::{categorize, command_hash, LocalStore};
use mcpterm_tools::{events::ToolEvent, BashOutcome, BashTool};

use crate::events::AgentEvent;

/// Question surface forms that almost always need a look at the real
/// system.  A match steers the first model turn to `tool_choice = any`.
const INSPECTION_KEYWORDS: &[&str] = &[
    "service", "systemd", "daemon", "log", "journal", "disk", "filesystem", "mount",
    "partition", "network", "interface", "port", "socket", "dns", "firewall", "iptables",
    "ufw", "fail2ban", "banned", "container", "docker", "process", "cpu", "memory", "ram",
    "swap", "kernel", "package", "uptime", "load",
];

/// Pick the tool-choice mode for the opening turn.  Inspection-flavoured
/// questions force a tool call; everything else lets the model decide.
pub fn choose_tool_choice(question: &str) -> ToolChoice {
    let q = question.to_lowercase();
    if INSPECTION_KEYWORDS.iter().any(|k| q.contains(k)) {
        ToolChoice::Any
    } else {
        ToolChoice::Auto
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hard cap on model ↔ tool rounds per turn.
    pub max_iterations: u32,
    /// Wall-clock budget for the whole turn.
    pub max_execution_time: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_execution_time: Duration::from_secs(60),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// What one turn produced.  The shape is the contract; shell side effects
/// are not required to be reproducible.
#[derive(Debug)]
pub struct TurnOutcome {
    pub success: bool,
    pub direct_answer: String,
    pub executed_commands: Vec<String>,
    pub results: Vec<BashOutcome>,
    pub iterations: u32,
    pub tool_calls: u32,
    pub tokens_used: u32,
    pub duration: Duration,
}

pub struct Orchestrator {
    model: Arc<dyn ModelProvider>,
    bash: Option<Arc<BashTool>>,
    config: OrchestratorConfig,
    system_prompt: String,
    /// Read-through cache for idempotent shell outputs, keyed by
    /// `sha256(command ‖ machine_id)` with per-category TTLs.
    cache: Option<(Arc<LocalStore>, String)>,
}

struct StreamedTurn {
    text: String,
    tool_uses: Vec<ToolUse>,
    stop: StopReason,
    tokens: u32,
}

struct ToolUse {
    id: String,
    name: String,
    input: Value,
}

enum PreparedCall {
    /// Served from the command cache; no process is spawned.
    Cached(BashOutcome),
    /// Execute with an optional per-call timeout override (seconds).
    Run(String, Option<u64>),
    /// Not a well-formed bash call; answered with an error result.
    Malformed,
}

struct PendingToolUse {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolUse {
    /// Resolve the accumulated argument JSON.  The input must end up an
    /// object — providers reject `null` on the echo-back — so unparseable
    /// or empty arguments degrade to `{}` with a warning.
    fn finish(self) -> ToolUse {
        let input = if self.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool = %self.name,
                        error = %e,
                        "tool_use arguments were not valid JSON; substituting {{}}"
                    );
                    Value::Object(Default::default())
                }
            }
        };
        ToolUse { id: self.id, name: self.name, input }
    }
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        bash: Option<BashTool>,
        config: OrchestratorConfig,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            model,
            bash: bash.map(Arc::new),
            config,
            system_prompt: system_prompt.into(),
            cache: None,
        }
    }

    /// Enable the command-output cache.  Only successful, untruncated
    /// outputs are stored; hits skip the process spawn entirely.
    pub fn with_cache(mut self, store: Arc<LocalStore>, machine_id: impl Into<String>) -> Self {
        self.cache = Some((store, machine_id.into()));
        self
    }

    /// True when the agentic loop is active: the bash tool is configured
    /// and the provider speaks native tool calls.
    pub fn tools_enabled(&self) -> bool {
        self.bash.is_some() && self.model.supports_tools()
    }

    /// Drive one turn.  `messages` is the assembled context window ending
    /// with the current user question.  Progress streams through `tx`;
    /// `ai_token` aborts every await point.
    pub async fn run(
        &self,
        messages: Vec<Message>,
        tx: mpsc::Sender<AgentEvent>,
        ai_token: CancellationToken,
    ) -> Result<TurnOutcome, ModelError> {
        let started = Instant::now();

        let Some(bash) = self.bash.as_ref().filter(|_| self.model.supports_tools()) else {
            return self.run_plain(messages, tx, ai_token, started).await;
        };
        let bash = Arc::clone(bash);

        let question = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
            .unwrap_or_default();
        let mut tool_choice = choose_tool_choice(&question);
        let spec = BashTool::spec();
        let tools = vec![ToolSchema {
            name: spec.name,
            description: spec.description,
            parameters: spec.parameters,
        }];

        let mut messages = messages;
        let mut iterations = 0u32;
        let mut tool_calls = 0u32;
        let mut tokens_used = 0u32;
        let mut executed_commands: Vec<String> = Vec::new();
        let mut results: Vec<BashOutcome> = Vec::new();
        let mut final_text = String::new();

        loop {
            if iterations >= self.config.max_iterations {
                debug!(iterations, "iteration budget exhausted");
                break;
            }
            if started.elapsed() > self.config.max_execution_time {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "wall budget exhausted");
                break;
            }

            let turn = self
                .stream_turn(&messages, &tools, tool_choice, &tx, &ai_token)
                .await?;
            tokens_used += turn.tokens;

            // stop_reason = tool_use is the normal signal; a provider that
            // emitted tool_use blocks without it is treated the same way.
            if turn.tool_uses.is_empty() {
                debug!(stop = ?turn.stop, "turn ended without tool calls");
                final_text = turn.text;
                break;
            }

            // Echo the model's turn back verbatim: text block (if any)
            // followed by every tool_use block.
            let mut blocks: Vec<ContentBlock> = Vec::new();
            if !turn.text.is_empty() {
                blocks.push(ContentBlock::Text { text: turn.text.clone() });
            }
            for u in &turn.tool_uses {
                blocks.push(ContentBlock::ToolUse {
                    id: u.id.clone(),
                    name: u.name.clone(),
                    input: u.input.clone(),
                });
            }
            messages.push(Message::assistant_blocks(blocks));

            let outcomes = self
                .execute_tool_round(&bash, &turn.tool_uses, &tx, &ai_token)
                .await?;

            let mut result_blocks = Vec::with_capacity(outcomes.len());
            for (id, outcome) in outcomes {
                tool_calls += 1;
                if !outcome.blocked && !outcome.command.is_empty() {
                    executed_commands.push(outcome.command.clone());
                }
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: outcome.output.clone(),
                    is_error: !outcome.success,
                });
                results.push(outcome);
            }
            messages.push(Message::tool_results(result_blocks));
            iterations += 1;
            // Only the opening turn is ever forced; from here the model
            // decides when it has seen enough.
            tool_choice = ToolChoice::Auto;
        }

        // The loop can end holding only tool results (budget breach, or a
        // model that stopped without prose).  Ask once more, tools off, to
        // force a textual synthesis of what was gathered.
        if final_text.is_empty() && iterations > 0 {
            let turn = self
                .stream_turn(&messages, &[], ToolChoice::None, &tx, &ai_token)
                .await?;
            tokens_used += turn.tokens;
            final_text = turn.text;
        }

        let _ = tx.send(AgentEvent::TurnComplete).await;
        Ok(TurnOutcome {
            success: !final_text.is_empty(),
            direct_answer: final_text,
            executed_commands,
            results,
            iterations,
            tool_calls,
            tokens_used,
            duration: started.elapsed(),
        })
    }

    /// Degraded path for providers without tool support (and for turns with
    /// the bash tool disabled): one plain completion, no shell access.
    async fn run_plain(
        &self,
        messages: Vec<Message>,
        tx: mpsc::Sender<AgentEvent>,
        ai_token: CancellationToken,
        started: Instant,
    ) -> Result<TurnOutcome, ModelError> {
        let turn = self
            .stream_turn(&messages, &[], ToolChoice::None, &tx, &ai_token)
            .await?;
        let _ = tx.send(AgentEvent::TurnComplete).await;
        Ok(TurnOutcome {
            success: !turn.text.is_empty(),
            direct_answer: turn.text,
            executed_commands: Vec::new(),
            results: Vec::new(),
            iterations: 0,
            tool_calls: 0,
            tokens_used: turn.tokens,
            duration: started.elapsed(),
        })
    }

    /// One model call: stream deltas out, collect text, tool uses, stop
    /// reason, and usage.
    async fn stream_turn(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        tool_choice: ToolChoice,
        tx: &mpsc::Sender<AgentEvent>,
        ai_token: &CancellationToken,
    ) -> Result<StreamedTurn, ModelError> {
        let req = CompletionRequest {
            system: Some(self.system_prompt.clone()),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            tool_choice,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let mut stream = self.model.complete(req, ai_token.clone()).await?;

        let mut text = String::new();
        // Keyed by the provider's block index: parallel tool calls
        // interleave their argument chunks.
        let mut pending: BTreeMap<u32, PendingToolUse> = BTreeMap::new();
        let mut stop = StopReason::EndTurn;
        let mut tokens = 0u32;

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    text.push_str(&delta);
                    let _ = tx.send(AgentEvent::TextDelta(delta)).await;
                }
                ResponseEvent::ToolUseStart { index, id, name } => {
                    pending.insert(index, PendingToolUse { id, name, args_buf: String::new() });
                }
                ResponseEvent::ToolUseInputDelta { index, partial_json } => {
                    pending
                        .entry(index)
                        .or_insert_with(|| PendingToolUse {
                            id: String::new(),
                            name: String::new(),
                            args_buf: String::new(),
                        })
                        .args_buf
                        .push_str(&partial_json);
                }
                ResponseEvent::StopReason(r) => stop = r,
                ResponseEvent::Usage { input_tokens, output_tokens } => {
                    tokens += input_tokens + output_tokens;
                    let _ = tx
                        .send(AgentEvent::TokenUsage { input: input_tokens, output: output_tokens })
                        .await;
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => warn!("model stream warning: {e}"),
                _ => {}
            }
        }

        if !text.is_empty() {
            let _ = tx.send(AgentEvent::TextComplete(text.clone())).await;
        }

        // BTreeMap iteration is index order, which is emission order.
        let mut tool_uses = Vec::with_capacity(pending.len());
        for (i, (_, ptu)) in pending.into_iter().enumerate() {
            if ptu.name.is_empty() {
                warn!("dropping tool_use with empty name; cannot dispatch");
                continue;
            }
            let mut tu = ptu.finish();
            if tu.id.is_empty() {
                tu.id = format!("toolu_synthetic_{i}");
            }
            tool_uses.push(tu);
        }

        Ok(StreamedTurn { text, tool_uses, stop, tokens })
    }

    /// Run one round of tool calls in parallel.  Each call gets a progress
    /// event pair; the whole round aborts promptly when the token fires
    /// (dropping the in-flight futures kills their child processes).
    async fn execute_tool_round(
        &self,
        bash: &Arc<BashTool>,
        uses: &[ToolUse],
        tx: &mpsc::Sender<AgentEvent>,
        ai_token: &CancellationToken,
    ) -> Result<Vec<(String, BashOutcome)>, ModelError> {
        let mut prepared: Vec<(String, PreparedCall)> = Vec::new();
        for u in uses {
            if u.name != "bash" {
                prepared.push((u.id.clone(), PreparedCall::Malformed));
                continue;
            }
            let command = u.input.get("command").and_then(Value::as_str).map(str::to_string);
            let timeout = u.input.get("timeout").and_then(Value::as_u64);
            match command {
                Some(c) => {
                    let _ = tx.send(AgentEvent::Tool(ToolEvent::started(&c))).await;
                    match self.cache_lookup(&c) {
                        Some(hit) => prepared.push((u.id.clone(), PreparedCall::Cached(hit))),
                        None => prepared.push((u.id.clone(), PreparedCall::Run(c, timeout))),
                    }
                }
                None => prepared.push((u.id.clone(), PreparedCall::Malformed)),
            }
        }

        let futures = prepared.iter().map(|(_, call)| {
            let bash = Arc::clone(bash);
            async move {
                match call {
                    PreparedCall::Cached(hit) => hit.clone(),
                    PreparedCall::Run(command, timeout) => bash.execute(command, *timeout).await,
                    PreparedCall::Malformed => BashOutcome {
                        command: String::new(),
                        output: "malformed tool call: expected bash {\"command\": ...}".into(),
                        success: false,
                        truncated: false,
                        blocked: false,
                        duration_ms: 0,
                    },
                }
            }
        });

        let outcomes = tokio::select! {
            biased;
            _ = ai_token.cancelled() => return Err(ModelError::Aborted),
            o = futures::future::join_all(futures) => o,
        };

        let mut out = Vec::with_capacity(outcomes.len());
        for ((id, call), outcome) in prepared.into_iter().zip(outcomes) {
            if let PreparedCall::Run(requested, _) = &call {
                self.cache_store(requested, &outcome);
            }
            let event = if outcome.blocked {
                ToolEvent::blocked(&outcome.command, &outcome.output)
            } else {
                ToolEvent::finished(&outcome.command, &outcome.output, outcome.success)
            };
            let _ = tx.send(AgentEvent::Tool(event)).await;
            out.push((id, outcome));
        }
        Ok(out)
    }

    /// TTL-checked cache read.  A hit answers without spawning a process.
    fn cache_lookup(&self, command: &str) -> Option<BashOutcome> {
        let (store, machine_id) = self.cache.as_ref()?;
        let hash = command_hash(command, machine_id);
        match store.cache_get(&hash, categorize(command).ttl()) {
            Ok(Some(entry)) => {
                debug!(command, "command cache hit");
                Some(BashOutcome {
                    command: command.to_string(),
                    output: entry.output,
                    success: true,
                    truncated: false,
                    blocked: false,
                    duration_ms: 0,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!("command cache read failed: {e}");
                None
            }
        }
    }

    /// Cache only clean outputs: successful, not refused, not truncated.
    fn cache_store(&self, requested: &str, outcome: &BashOutcome) {
        let Some((store, machine_id)) = self.cache.as_ref() else {
            return;
        };
        if !outcome.success || outcome.blocked || outcome.truncated {
            return;
        }
        let hash = command_hash(requested, machine_id);
        if let Err(e) = store.cache_put(
            &hash,
            requested,
            &outcome.output,
            Some(machine_id),
            outcome.duration_ms as i64,
        ) {
            warn!("command cache write failed: {e}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
