// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One typed block inside a message's content array.
///
/// The serialized form matches the provider wire format directly: tool
/// results travel inside a user-role message referencing the `tool_use` id
/// they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// A single message in the conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Assistant message carrying the blocks exactly as the model produced
    /// them (text and/or tool_use).  Used to echo a tool-calling turn back
    /// into the conversation.
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content: blocks }
    }

    /// User-role message carrying tool results for the previous turn's
    /// tool_use blocks.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content: blocks }
    }

    /// Concatenation of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// The plain text of this message if it consists of exactly one text block.
    pub fn as_text(&self) -> Option<&str> {
        match self.content.as_slice() {
            [ContentBlock::Text { text }] => Some(text),
            _ => None,
        }
    }

    /// True when any block is a tool_use request.
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    /// Approximate token count (4 chars ≈ 1 token).  Reporting only — never
    /// used to make truncation decisions.
    pub fn approx_tokens(&self) -> usize {
        let chars: usize = self
            .content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::ToolUse { name, input, .. } => {
                    name.len() + input.to_string().len()
                }
                ContentBlock::ToolResult { content, .. } => content.len(),
            })
            .sum();
        (chars / 4).max(1)
    }
}

// ─── Request types ────────────────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub parameters: Value,
}

/// How strongly the model is steered toward calling tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// The model decides freely.
    #[default]
    Auto,
    /// The model must call at least one tool.
    Any,
    /// Tool calls are disabled for this turn.
    None,
}

impl ToolChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolChoice::Auto => "auto",
            ToolChoice::Any => "any",
            ToolChoice::None => "none",
        }
    }
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// System prompt, sent out-of-band from the message list.
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    pub temperature: f32,
}

// ─── Response types ───────────────────────────────────────────────────────────

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    StopSequence,
    Error,
}

impl StopReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "tool_use" => Self::ToolUse,
            "stop_sequence" => Self::StopSequence,
            "end_turn" | "max_tokens" => Self::EndTurn,
            _ => Self::Error,
        }
    }
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// The model opened a tool_use block.  Arguments follow as
    /// [`ResponseEvent::ToolUseInputDelta`] chunks for the same index.
    ToolUseStart { index: u32, id: String, name: String },
    /// Partial JSON for the arguments of the tool_use block at `index`.
    ToolUseInputDelta { index: u32, partial_json: String },
    /// The model signalled why it is stopping.
    StopReason(StopReason),
    /// Token usage statistics.
    Usage { input_tokens: u32, output_tokens: u32 },
    /// The stream finished normally.
    Done,
    /// A recoverable in-stream error (non-fatal warning).
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn text_concatenates_text_blocks_only() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::Text { text: "a".into() },
            ContentBlock::ToolUse { id: "t1".into(), name: "bash".into(), input: json!({}) },
            ContentBlock::Text { text: "b".into() },
        ]);
        assert_eq!(m.text(), "ab");
        assert!(m.as_text().is_none());
    }

    #[test]
    fn has_tool_use_detects_block() {
        let plain = Message::assistant("hi");
        assert!(!plain.has_tool_use());
        let tc = Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "t".into(),
            name: "bash".into(),
            input: json!({"command": "ls"}),
        }]);
        assert!(tc.has_tool_use());
    }

    #[test]
    fn content_block_serializes_with_type_tag() {
        let b = ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "ok".into(),
            is_error: false,
        };
        let v = serde_json::to_value(&b).unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(v["tool_use_id"], "t1");
    }

    #[test]
    fn tool_result_is_error_defaults_false_on_deserialize() {
        let b: ContentBlock = serde_json::from_str(
            r#"{"type":"tool_result","tool_use_id":"x","content":"y"}"#,
        )
        .unwrap();
        assert!(matches!(b, ContentBlock::ToolResult { is_error: false, .. }));
    }

    #[test]
    fn stop_reason_parses_known_values() {
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("stop_sequence"), StopReason::StopSequence);
        assert_eq!(StopReason::parse("garbage"), StopReason::Error);
    }

    #[test]
    fn approx_tokens_divides_by_four_with_floor_of_one() {
        assert_eq!(Message::user("12345678").approx_tokens(), 2);
        assert_eq!(Message::user("hi").approx_tokens(), 1);
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = Message::user("test payload");
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::User);
        assert_eq!(back.as_text(), Some("test payload"));
    }
}
