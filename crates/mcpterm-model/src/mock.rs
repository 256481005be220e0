// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic mock providers for tests.  No network access.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::provider::{abortable, ResponseStream};
use crate::{CompletionRequest, ModelError, ResponseEvent, StopReason};

/// A pre-scripted provider.  Each `complete` call pops the next event script
/// from the front of the queue, so tests can specify exact sequences —
/// including tool calls — per round.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    supports_tools: bool,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            supports_tools: true,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Declare that this mock has no native tool support, forcing the
    /// orchestrator onto its plain-completion fallback path.
    pub fn without_tool_support(mut self) -> Self {
        self.supports_tools = false;
        self
    }

    /// Provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// Event script for a plain text turn.
    pub fn text_script(reply: impl Into<String>) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::TextDelta(reply.into()),
            ResponseEvent::StopReason(StopReason::EndTurn),
            ResponseEvent::Usage { input_tokens: 10, output_tokens: 10 },
            ResponseEvent::Done,
        ]
    }

    /// Event script for a turn that requests one `bash` call.
    pub fn bash_call_script(id: impl Into<String>, command: &str) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::ToolUseStart { index: 0, id: id.into(), name: "bash".into() },
            ResponseEvent::ToolUseInputDelta {
                index: 0,
                partial_json: format!(r#"{{"command": {}}}"#, serde_json::json!(command)),
            },
            ResponseEvent::StopReason(StopReason::ToolUse),
            ResponseEvent::Done,
        ]
    }

    /// Provider that emits one tool call, then a text reply on the next round.
    pub fn tool_then_text(command: &str, final_text: impl Into<String>) -> Self {
        Self::new(vec![
            Self::bash_call_script("tu_1", command),
            Self::text_script(final_text),
        ])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock"
    }
    fn supports_tools(&self) -> bool {
        self.supports_tools
    }

    async fn complete(
        &self,
        req: CompletionRequest,
        abort: CancellationToken,
    ) -> Result<ResponseStream, ModelError> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Self::text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<ResponseEvent, ModelError>> =
            events.into_iter().map(Ok).collect();
        Ok(abortable(Box::pin(stream::iter(wrapped)), abort))
    }
}

/// A provider whose stream never produces an event.  Used to test
/// cancellation: the only way the stream resolves is through the abort token.
pub struct StallingProvider;

#[async_trait]
impl crate::ModelProvider for StallingProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "stalling-mock"
    }

    async fn complete(
        &self,
        _req: CompletionRequest,
        abort: CancellationToken,
    ) -> Result<ResponseStream, ModelError> {
        Ok(abortable(Box::pin(stream::pending()), abort))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{Message, ModelProvider};

    fn req() -> CompletionRequest {
        CompletionRequest { messages: vec![Message::user("hi")], ..Default::default() }
    }

    #[tokio::test]
    async fn scripted_single_text_reply() {
        let p = ScriptedProvider::always_text("hello world");
        let mut s = p.complete(req(), CancellationToken::new()).await.unwrap();
        let ev = s.next().await.unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "hello world"));
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedProvider::always_text("x");
        let _ = p.complete(req(), CancellationToken::new()).await.unwrap();
        let seen = p.last_request.lock().unwrap();
        assert_eq!(seen.as_ref().unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn bash_call_script_parses_back_to_valid_json() {
        let script = ScriptedProvider::bash_call_script("tu_1", "df -h");
        let json = script
            .iter()
            .find_map(|e| match e {
                ResponseEvent::ToolUseInputDelta { partial_json, .. } => {
                    Some(partial_json.clone())
                }
                _ => None,
            })
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["command"], "df -h");
    }

    #[tokio::test]
    async fn stalling_provider_resolves_only_on_abort() {
        let p = StallingProvider;
        let token = CancellationToken::new();
        let mut s = p.complete(req(), token.clone()).await.unwrap();
        let task = tokio::spawn(async move { s.next().await });
        token.cancel();
        let item = task.await.unwrap();
        assert!(matches!(item, Some(Err(ModelError::Aborted))));
    }

    #[tokio::test]
    async fn scripts_are_consumed_in_order() {
        let p = ScriptedProvider::new(vec![
            ScriptedProvider::text_script("first"),
            ScriptedProvider::text_script("second"),
        ]);
        for expected in ["first", "second"] {
            let mut s = p.complete(req(), CancellationToken::new()).await.unwrap();
            let ev = s.next().await.unwrap().unwrap();
            assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == expected));
        }
    }
}
