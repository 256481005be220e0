// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use mcpterm_tools::events::ToolEvent;

/// Events emitted by the orchestrator during a single turn, in the order
/// they occur.  The interaction loop renders them live.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// The full text of one model turn, after streaming finishes.
    TextComplete(String),
    /// A tool call started, finished, or was refused.
    Tool(ToolEvent),
    /// Token usage update.
    TokenUsage { input: u32, output: u32 },
    /// The orchestrator finished processing the turn.
    TurnComplete,
}
