// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The single-threaded cooperative interaction loop: keyboard events, agent
//! progress, and housekeeping ticks multiplexed over one `select!`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{Event, EventStream, KeyEvent, KeyEventKind};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use mcpterm_core::{
    compact::{compact_history, CompactError},
    AgentEvent, History, Orchestrator, Phase, RequestKind, RequestLifecycle, TurnOutcome,
};
use mcpterm_model::{ModelError, ModelProvider};
use mcpterm_store::{Partition, SessionRow, SyncHandle};
use mcpterm_tools::events::ToolEventKind;

use crate::commands::{help_text, parse_command, strip_paste_markers, SpecialCommand};
use crate::keys::{map_key, Action};
use crate::render::Screen;
use crate::state::{AppState, AppStatus};

/// Second Ctrl-C within this window exits.
const CTRL_C_WINDOW: Duration = Duration::from_millis(500);
/// Repeat Esc presses inside this window are one cancellation.
const ESC_DEBOUNCE: Duration = Duration::from_millis(200);
/// Sessions close after this much keyboard silence.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

pub struct AppOptions {
    pub min_compact_messages: usize,
    pub max_tokens: u32,
    pub debug: bool,
    /// Shown by `/status`, e.g. "anthropic/claude-sonnet-4-5".
    pub provider_label: String,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Exit,
}

struct ActiveTurn {
    request_id: String,
    rx: mpsc::Receiver<AgentEvent>,
    task: JoinHandle<Result<TurnOutcome, ModelError>>,
    /// Text streamed so far; becomes the stored partial answer on cancel.
    partial: String,
}

enum TurnStep {
    Event(AgentEvent),
    Finished(Result<Result<TurnOutcome, ModelError>, tokio::task::JoinError>),
}

enum LoopEvent {
    Term(Event),
    Turn(TurnStep),
    Tick,
    EndOfInput,
}

pub struct App {
    state: AppState,
    lifecycle: RequestLifecycle,
    history: History,
    orchestrator: Arc<Orchestrator>,
    model: Arc<dyn ModelProvider>,
    sync: Option<SyncHandle>,
    screen: Screen,
    options: AppOptions,
    turn: Option<ActiveTurn>,
    last_activity: Instant,
    session_open: bool,
    debug: bool,
}

impl App {
    pub fn new(
        history: History,
        orchestrator: Arc<Orchestrator>,
        model: Arc<dyn ModelProvider>,
        sync: Option<SyncHandle>,
        options: AppOptions,
    ) -> Self {
        let debug = options.debug;
        Self {
            state: AppState::new(),
            lifecycle: RequestLifecycle::new(),
            history,
            orchestrator,
            model,
            sync,
            screen: Screen::new(),
            options,
            turn: None,
            last_activity: Instant::now(),
            session_open: true,
            debug,
        }
    }

    /// Run until the user exits.  Assumes raw mode is already enabled; the
    /// caller restores the terminal.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.state.status = AppStatus::Ready;
        self.screen.print_line("mcpterm ready — ask about this machine, /help for commands.")?;

        let mut events = EventStream::new();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.render()?;

            // next_turn_step is pending forever while no turn is active, so
            // the branch needs no precondition.
            let loop_event = tokio::select! {
                biased;
                step = Self::next_turn_step(&mut self.turn) => LoopEvent::Turn(step),
                maybe = events.next() => match maybe {
                    Some(Ok(ev)) => LoopEvent::Term(ev),
                    Some(Err(e)) => return Err(e.into()),
                    None => LoopEvent::EndOfInput,
                },
                _ = tick.tick() => LoopEvent::Tick,
            };

            let flow = match loop_event {
                LoopEvent::Term(ev) => self.handle_terminal_event(ev).await?,
                LoopEvent::Turn(TurnStep::Event(ev)) => {
                    self.handle_agent_event(ev)?;
                    Flow::Continue
                }
                LoopEvent::Turn(TurnStep::Finished(res)) => {
                    self.handle_turn_finished(res)?;
                    Flow::Continue
                }
                LoopEvent::Tick => {
                    self.on_tick()?;
                    Flow::Continue
                }
                LoopEvent::EndOfInput => Flow::Exit,
            };
            if flow == Flow::Exit {
                break;
            }
        }
        self.shutdown()
    }

    /// Await the next agent event or the task result.  Buffered events
    /// drain before the completion is observed (`biased`).
    async fn next_turn_step(turn: &mut Option<ActiveTurn>) -> TurnStep {
        let Some(t) = turn.as_mut() else {
            return futures::future::pending().await;
        };
        tokio::select! {
            biased;
            Some(ev) = t.rx.recv() => TurnStep::Event(ev),
            res = &mut t.task => TurnStep::Finished(res),
        }
    }

    // ─── Terminal events ──────────────────────────────────────────────────────

    async fn handle_terminal_event(&mut self, ev: Event) -> anyhow::Result<Flow> {
        match ev {
            Event::Key(key) if key.kind != KeyEventKind::Release => {
                self.last_activity = Instant::now();
                self.reopen_session_if_needed()?;
                self.handle_key(key).await
            }
            Event::Paste(text) => {
                self.state.insert_str(&strip_paste_markers(&text));
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Continue),
        }
    }

    async fn handle_key(&mut self, key: KeyEvent) -> anyhow::Result<Flow> {
        let Some(action) = map_key(&key) else {
            return Ok(Flow::Continue);
        };
        match action {
            Action::Insert(c) => self.state.insert_char(c),
            Action::Backspace => self.state.backspace(),
            Action::CursorLeft => self.state.cursor_left(),
            Action::CursorRight => self.state.cursor_right(),
            Action::HistoryPrev if !self.state.is_processing => self.state.history_prev(),
            Action::HistoryNext if !self.state.is_processing => self.state.history_next(),
            Action::HistoryPrev | Action::HistoryNext => {}
            Action::Submit => return self.handle_submit().await,
            Action::Escape => self.handle_escape()?,
            Action::CtrlC => return self.handle_ctrl_c(),
            Action::CtrlD => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    fn handle_ctrl_c(&mut self) -> anyhow::Result<Flow> {
        let now = Instant::now();
        if let Some(last) = self.state.last_ctrl_c {
            if now.duration_since(last) <= CTRL_C_WINDOW {
                return Ok(Flow::Exit);
            }
        }
        self.state.last_ctrl_c = Some(now);
        self.screen.clear_prompt_line()?;
        self.screen.print_line("(press Ctrl-C again to exit)")?;
        Ok(Flow::Continue)
    }

    fn handle_escape(&mut self) -> anyhow::Result<()> {
        if self.state.is_processing {
            let now = Instant::now();
            if let Some(last) = self.state.last_esc {
                if now.duration_since(last) < ESC_DEBOUNCE {
                    return Ok(());
                }
            }
            self.state.last_esc = Some(now);
            self.cancel_current()?;
        } else {
            self.state.clear_input();
        }
        Ok(())
    }

    /// Esc during processing: signal C2, persist the cancelled turn with
    /// whatever text streamed so far, and append the cancellation notice.
    fn cancel_current(&mut self) -> anyhow::Result<()> {
        let Some(turn) = self.turn.as_ref() else {
            return Ok(());
        };
        let request_id = turn.request_id.clone();
        let partial = turn.partial.clone();
        if !self.lifecycle.cancel(&request_id, "esc") {
            return Ok(());
        }
        match self.history.cancel_turn(&request_id, Some(&partial)) {
            Ok(_) => {}
            Err(e) => warn!("persisting cancellation failed: {e}"),
        }
        self.state.is_cancelled = true;
        self.state.is_processing = false;
        self.state.status = AppStatus::Ready;
        self.screen.print("\n")?;
        self.screen.print_line("Request cancelled.")?;
        Ok(())
    }

    // ─── Submission ───────────────────────────────────────────────────────────

    async fn handle_submit(&mut self) -> anyhow::Result<Flow> {
        if self.state.is_processing {
            return Ok(Flow::Continue);
        }
        // Backslash at end of line continues input on the next line.
        if self.state.input.ends_with('\\') {
            self.state.continue_line();
            return Ok(Flow::Continue);
        }
        let input = self.state.take_input();
        let input = input.trim().to_string();
        if input.is_empty() {
            return Ok(Flow::Continue);
        }

        self.screen.clear_prompt_line()?;
        self.screen.print_line(&format!("❯ {input}"))?;
        self.state.push_command_history(&input);

        if let Some(cmd) = parse_command(&input) {
            return self.run_special(cmd).await;
        }
        self.start_turn(&input)?;
        Ok(Flow::Continue)
    }

    fn start_turn(&mut self, input: &str) -> anyhow::Result<()> {
        // A cancelled turn may still be winding down when the next question
        // arrives; reap it so at most one request is ever in flight.
        if let Some(old) = self.turn.take() {
            old.task.abort();
            self.lifecycle.complete(&old.request_id);
        }
        let handle = self.lifecycle.begin(RequestKind::Chat);

        // A failing local write is a warning, not a fatal error: the turn
        // still runs, it is just not persisted.
        if let Err(e) = self.history.begin_turn(&handle.request_id, input) {
            warn!("recording turn failed: {e}");
            self.screen.print_line("(warning: could not persist this turn locally)")?;
        } else if let Err(e) = self.history.mark_processing(&handle.request_id) {
            warn!("marking turn processing failed: {e}");
        }

        self.state.status = AppStatus::Processing;
        self.state.is_processing = true;
        self.state.is_cancelled = false;
        self.state.error = None;
        self.state.response.clear();
        self.state.execution_log.clear();

        let context = self.history.context_window();
        let (tx, rx) = mpsc::channel(64);
        let orchestrator = Arc::clone(&self.orchestrator);
        let ai_token = handle.ai_token.clone();
        let task =
            tokio::spawn(async move { orchestrator.run(context, tx, ai_token).await });

        self.lifecycle.set_phase(&handle.request_id, Phase::AiInflight);
        self.turn = Some(ActiveTurn {
            request_id: handle.request_id,
            rx,
            task,
            partial: String::new(),
        });
        Ok(())
    }

    // ─── Agent events ─────────────────────────────────────────────────────────

    fn handle_agent_event(&mut self, ev: AgentEvent) -> anyhow::Result<()> {
        match ev {
            AgentEvent::TextDelta(delta) => {
                if let Some(t) = self.turn.as_mut() {
                    t.partial.push_str(&delta);
                }
                // A cancelled turn may still flush a few buffered chunks;
                // they are kept for the stored partial but not rendered.
                if !self.state.is_cancelled {
                    self.screen.print(&delta)?;
                }
            }
            AgentEvent::TextComplete(_) => {
                if !self.state.is_cancelled {
                    self.screen.print("\n")?;
                }
            }
            AgentEvent::Tool(event) => {
                if !self.state.is_cancelled {
                    let line = match event.kind {
                        ToolEventKind::Started => format!("  $ {}", event.command),
                        ToolEventKind::Finished => {
                            let ok = event.success.unwrap_or(false);
                            format!("  {} {}", if ok { "✓" } else { "✗" }, event.command)
                        }
                        ToolEventKind::Blocked => {
                            format!("  ⛔ {} (refused: destructive)", event.command)
                        }
                    };
                    self.screen.print_line(&line)?;
                    if self.debug && event.kind == ToolEventKind::Finished {
                        if let Some(out) = &event.output {
                            self.screen.print_line(out.trim_end())?;
                        }
                    }
                }
                self.state.execution_log.push(event);
            }
            AgentEvent::TokenUsage { input, output } => {
                debug!(input, output, "token usage");
            }
            AgentEvent::TurnComplete => {}
        }
        Ok(())
    }

    fn handle_turn_finished(
        &mut self,
        res: Result<Result<TurnOutcome, ModelError>, tokio::task::JoinError>,
    ) -> anyhow::Result<()> {
        let Some(turn) = self.turn.take() else {
            return Ok(());
        };
        let request_id = turn.request_id;
        self.lifecycle.set_phase(&request_id, Phase::DbInflight);
        let was_cancelled = self.lifecycle.was_cancelled(&request_id);

        match res {
            _ if was_cancelled => {
                // Cancellation bookkeeping already happened in
                // cancel_current(); nothing more to persist.
            }
            Ok(Ok(outcome)) if outcome.success => {
                self.state.response = outcome.direct_answer.clone();
                if let Err(e) = self.history.complete_turn(
                    &request_id,
                    &outcome.direct_answer,
                    Some(outcome.tokens_used as i64),
                    Some(outcome.duration.as_millis() as i64),
                ) {
                    warn!("persisting answer failed: {e}");
                }
                if self.debug {
                    self.screen.print_line(&format!(
                        "({} iterations, {} tool calls, {} ms)",
                        outcome.iterations,
                        outcome.tool_calls,
                        outcome.duration.as_millis(),
                    ))?;
                }
                // Nudge the sync worker so the finished turn replicates
                // promptly instead of waiting for the next periodic wake.
                if let Some(sync) = &self.sync {
                    sync.force_sync();
                }
            }
            Ok(Ok(outcome)) => {
                // Bounds breached without any synthesized text.
                if let Err(e) = self.history.fail_turn(
                    &request_id,
                    "NO_ANSWER",
                    "the assistant produced no answer within its budget",
                ) {
                    warn!("persisting failed turn failed: {e}");
                }
                self.state.error = Some("no answer was produced".into());
                self.screen.print_line(&format!(
                    "No answer was produced (after {} tool calls). Try rephrasing.",
                    outcome.tool_calls,
                ))?;
            }
            Ok(Err(e)) if e.is_abort() => {
                // The abort raced the Esc handler; make sure the turn ends
                // cancelled even if the keypress path lost the race.
                if let Err(err) = self.history.cancel_turn(&request_id, Some(&turn.partial)) {
                    warn!("persisting cancellation failed: {err}");
                }
                self.state.is_cancelled = true;
            }
            Ok(Err(e)) => {
                let hint = e.user_hint();
                let code = match &e {
                    ModelError::RateLimited { .. } => "RATE_LIMITED",
                    ModelError::IdleTimeout(_) => "STREAM_TIMEOUT",
                    ModelError::Api { .. } => "API_ERROR",
                    _ => "TRANSPORT",
                };
                if let Err(err) = self.history.fail_turn(&request_id, code, &hint) {
                    warn!("persisting failed turn failed: {err}");
                }
                self.state.error = Some(hint.clone());
                self.screen.print_line(&format!("Error: {hint}"))?;
            }
            Err(join_err) => {
                warn!("turn task panicked: {join_err}");
                let _ = self.history.fail_turn(&request_id, "INTERNAL", "internal error");
                self.state.error = Some("internal error".into());
            }
        }

        self.lifecycle.complete(&request_id);
        self.state.is_processing = false;
        // An error status sticks until the next submission clears it.
        self.state.status = if self.state.error.is_some() {
            AppStatus::Error
        } else {
            AppStatus::Ready
        };
        Ok(())
    }

    // ─── Special commands ─────────────────────────────────────────────────────

    async fn run_special(&mut self, cmd: SpecialCommand) -> anyhow::Result<Flow> {
        match cmd {
            SpecialCommand::Help => self.screen.print_line(&help_text())?,
            SpecialCommand::Clear => {
                self.history.clear();
                self.screen.clear_screen()?;
            }
            SpecialCommand::History => self.show_history()?,
            SpecialCommand::Status => self.show_status()?,
            SpecialCommand::ToggleDebug => {
                self.debug = !self.debug;
                self.screen.print_line(&format!(
                    "debug {}",
                    if self.debug { "on" } else { "off" }
                ))?;
            }
            SpecialCommand::Exit => return Ok(Flow::Exit),
            SpecialCommand::Compact => self.run_compact().await?,
            SpecialCommand::Unknown(name) => {
                self.screen
                    .print_line(&format!("Unknown command: /{name} — type /help"))?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn run_compact(&mut self) -> anyhow::Result<()> {
        let handle = self.lifecycle.begin(RequestKind::Compact);
        self.screen.print_line("Compacting conversation…")?;
        let result = compact_history(
            &mut self.history,
            self.model.as_ref(),
            self.options.min_compact_messages,
            self.options.max_tokens,
            handle.ai_token.clone(),
        )
        .await;
        self.lifecycle.complete(&handle.request_id);
        match result {
            Ok(report) => self.screen.print_line(&report.to_string())?,
            Err(CompactError::TooSmall { have, need }) => {
                self.screen.print_line(&format!(
                    "History too small to compact ({have} entries, need {need})."
                ))?;
            }
            Err(e) => {
                warn!("compaction failed: {e}");
                self.screen.print_line(&format!("Compaction failed: {e}"))?;
            }
        }
        Ok(())
    }

    fn show_history(&mut self) -> anyhow::Result<()> {
        let turns = self.history.store().read_recent_turns(
            &Partition::Machine(self.history.machine_id().to_string()),
            10,
            None,
        )?;
        if turns.is_empty() {
            self.screen.print_line("No history yet on this machine.")?;
            return Ok(());
        }
        for t in turns {
            let response = t.response.as_deref().unwrap_or("—");
            let first_line = response.lines().next().unwrap_or("—");
            self.screen.print_line(&format!(
                "[{}] {} -> {}",
                t.status.as_str(),
                t.command,
                first_line,
            ))?;
        }
        Ok(())
    }

    fn show_status(&mut self) -> anyhow::Result<()> {
        self.screen.print_line(&format!("provider:  {}", self.options.provider_label))?;
        self.screen.print_line(&format!("machine:   {}", self.history.machine_id()))?;
        self.screen.print_line(&format!("session:   {}", self.history.session_id()))?;
        self.screen.print_line(&format!(
            "user:      {}",
            self.history
                .user_id()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "(anonymous)".into()),
        ))?;
        match &self.sync {
            Some(sync) => {
                let h = sync.health();
                self.screen.print_line(&format!(
                    "sync:      {} pushed, {} pulled, {} pending, {} dead-lettered",
                    h.pushed, h.pulled, h.pending, h.dead_lettered,
                ))?;
                if let Some(err) = h.last_error {
                    self.screen.print_line(&format!("sync err:  {err}"))?;
                }
            }
            None => self.screen.print_line("sync:      offline (no remote configured)")?,
        }
        self.screen
            .print_line(&format!("debug:     {}", if self.debug { "on" } else { "off" }))?;
        Ok(())
    }

    // ─── Housekeeping ─────────────────────────────────────────────────────────

    fn on_tick(&mut self) -> anyhow::Result<()> {
        if self.session_open
            && !self.state.is_processing
            && self.last_activity.elapsed() >= SESSION_IDLE_TIMEOUT
        {
            debug!("session idle timeout reached; closing session");
            if let Err(e) = self
                .history
                .store()
                .close_session(self.history.session_id(), chrono::Utc::now().timestamp())
            {
                warn!("closing idle session failed: {e}");
            }
            self.session_open = false;
        }
        Ok(())
    }

    fn reopen_session_if_needed(&mut self) -> anyhow::Result<()> {
        if self.session_open {
            return Ok(());
        }
        let session = SessionRow {
            id: Uuid::new_v4().to_string(),
            machine_id: self.history.machine_id().to_string(),
            user_id: self.history.user_id(),
            started_at: chrono::Utc::now().timestamp(),
            ended_at: None,
            command_count: 0,
        };
        if let Err(e) = self.history.store().open_session(&session) {
            warn!("opening new session failed: {e}");
            return Ok(());
        }
        self.history.set_session(&session.id);
        self.session_open = true;
        Ok(())
    }

    fn render(&mut self) -> anyhow::Result<()> {
        if !self.state.is_processing {
            self.screen.draw_prompt(&self.state.input, self.state.cursor)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.lifecycle.cancel_all("shutdown");
        if self.session_open {
            let _ = self
                .history
                .store()
                .close_session(self.history.session_id(), chrono::Utc::now().timestamp());
        }
        if let Some(sync) = &self.sync {
            sync.force_sync();
        }
        self.screen.print("\n")?;
        self.screen.print_line("bye.")?;
        Ok(())
    }
}
