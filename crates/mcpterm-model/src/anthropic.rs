// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::{abortable, with_idle_timeout, ResponseStream};
use crate::{CompletionRequest, Message, ModelError, ResponseEvent, Role, StopReason};

/// How long the SSE stream may stay silent before the request is failed.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: "https://api.anthropic.com".into(),
            max_tokens,
            temperature,
            client: reqwest::Client::new(),
        }
    }

    /// Override the API endpoint (local proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        req: CompletionRequest,
        abort: CancellationToken,
    ) -> Result<ResponseStream, ModelError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ModelError::Config("anthropic_api_key not set".into()))?;

        let max_tokens = if req.max_tokens > 0 { req.max_tokens } else { self.max_tokens };
        let body = build_request_body(&self.model, max_tokens, self.temperature, &req);

        debug!(model = %self.model, tools = req.tools.len(), "sending anthropic request");

        let send = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send();

        // The request itself is a suspension point and must honour the abort
        // token, not only the stream that follows it.
        let resp = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(ModelError::Aborted),
            r = send => r?,
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            if status == 429 {
                return Err(ModelError::RateLimited {
                    hint: "wait a moment and try again".into(),
                });
            }
            return Err(ModelError::Api { status, message: text });
        }

        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward.  Only complete lines (terminated by '\n') are
        // parsed; anything left over is prepended to the next chunk.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(
                            ModelError::Transport(e.to_string()),
                        )]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            events.extend(parse_sse_event(&v).into_iter().map(Ok));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        let stream = with_idle_timeout(Box::pin(event_stream), STREAM_IDLE_TIMEOUT);
        Ok(abortable(stream, abort))
    }
}

/// Serialize a [`CompletionRequest`] into the `/v1/messages` body.
///
/// System-role messages never appear in the `messages` array; their text is
/// folded into the top-level `system` field after the request-level system
/// prompt.
fn build_request_body(
    model: &str,
    max_tokens: u32,
    temperature: f32,
    req: &CompletionRequest,
) -> Value {
    let (system_text, messages) = split_system(&req.messages);

    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "temperature": temperature,
        "stream": true,
        "messages": messages,
    });

    let mut system = req.system.clone().unwrap_or_default();
    if !system_text.is_empty() {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&system_text);
    }
    if !system.is_empty() {
        body["system"] = json!(system);
    }

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
        body["tool_choice"] = json!({ "type": req.tool_choice.as_str() });
    }

    body
}

/// Extract system text and serialize the remaining messages for the wire.
fn split_system(messages: &[Message]) -> (String, Vec<Value>) {
    let system_text = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(Message::text)
        .collect::<Vec<_>>()
        .join("\n\n");

    let wire: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            json!({
                "role": match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => unreachable!(),
                },
                "content": m.content,
            })
        })
        .collect();

    (system_text, wire)
}

/// Map one parsed SSE JSON payload to zero or more [`ResponseEvent`]s.
fn parse_sse_event(v: &Value) -> Vec<ResponseEvent> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            let input = v["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0);
            vec![ResponseEvent::Usage {
                input_tokens: input as u32,
                output_tokens: 0,
            }]
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                vec![ResponseEvent::ToolUseStart {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                }]
            } else {
                vec![]
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("").to_string();
                    vec![ResponseEvent::TextDelta(text)]
                }
                "input_json_delta" => {
                    let partial = delta["partial_json"].as_str().unwrap_or("").to_string();
                    vec![ResponseEvent::ToolUseInputDelta { index, partial_json: partial }]
                }
                _ => vec![],
            }
        }
        "message_delta" => {
            let mut events = Vec::new();
            if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                events.push(ResponseEvent::StopReason(StopReason::parse(reason)));
            }
            if let Some(out) = v["usage"]["output_tokens"].as_u64() {
                events.push(ResponseEvent::Usage {
                    input_tokens: 0,
                    output_tokens: out as u32,
                });
            }
            events
        }
        "message_stop" => vec![ResponseEvent::Done],
        "error" => {
            let msg = v["error"]["message"].as_str().unwrap_or("unknown").to_string();
            vec![ResponseEvent::Error(msg)]
        }
        _ => vec![],
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{ContentBlock, ToolChoice, ToolSchema};

    fn req_with_tools() -> CompletionRequest {
        CompletionRequest {
            system: Some("be helpful".into()),
            messages: vec![Message::user("free disk space?")],
            tools: vec![ToolSchema {
                name: "bash".into(),
                description: "run a shell command".into(),
                parameters: json!({"type": "object"}),
            }],
            tool_choice: ToolChoice::Any,
            max_tokens: 4096,
            temperature: 0.7,
        }
    }

    #[test]
    fn body_includes_tools_and_tool_choice() {
        let body = build_request_body("m", 4096, 0.7, &req_with_tools());
        assert_eq!(body["tools"][0]["name"], "bash");
        assert_eq!(body["tool_choice"]["type"], "any");
    }

    #[test]
    fn body_omits_tools_when_empty() {
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let body = build_request_body("m", 100, 0.0, &req);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn system_messages_fold_into_system_field() {
        let req = CompletionRequest {
            system: Some("prefix".into()),
            messages: vec![
                Message::system("summary of prior conversation"),
                Message::user("next question"),
            ],
            ..Default::default()
        };
        let body = build_request_body("m", 100, 0.0, &req);
        let system = body["system"].as_str().unwrap();
        assert!(system.starts_with("prefix"));
        assert!(system.contains("summary of prior conversation"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn tool_result_serializes_inside_user_message() {
        let req = CompletionRequest {
            messages: vec![Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "tu_1".into(),
                content: "Filesystem /".into(),
                is_error: false,
            }])],
            ..Default::default()
        };
        let body = build_request_body("m", 100, 0.0, &req);
        let msg = &body["messages"][0];
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["content"][0]["type"], "tool_result");
        assert_eq!(msg["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn parse_text_delta() {
        let v = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "hello"}
        });
        let events = parse_sse_event(&v);
        assert!(matches!(&events[0], ResponseEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn parse_tool_use_start_and_input_delta() {
        let start = json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": {"type": "tool_use", "id": "tu_9", "name": "bash"}
        });
        let events = parse_sse_event(&start);
        assert!(matches!(
            &events[0],
            ResponseEvent::ToolUseStart { index: 1, id, name } if id == "tu_9" && name == "bash"
        ));

        let delta = json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "{\"comm"}
        });
        let events = parse_sse_event(&delta);
        assert!(matches!(
            &events[0],
            ResponseEvent::ToolUseInputDelta { index: 1, partial_json } if partial_json == "{\"comm"
        ));
    }

    #[test]
    fn parse_message_delta_carries_stop_reason() {
        let v = json!({
            "type": "message_delta",
            "delta": {"stop_reason": "tool_use"},
            "usage": {"output_tokens": 17}
        });
        let events = parse_sse_event(&v);
        assert!(matches!(events[0], ResponseEvent::StopReason(StopReason::ToolUse)));
        assert!(matches!(
            events[1],
            ResponseEvent::Usage { output_tokens: 17, .. }
        ));
    }

    #[test]
    fn parse_message_stop_is_done() {
        let v = json!({"type": "message_stop"});
        assert!(matches!(parse_sse_event(&v)[0], ResponseEvent::Done));
    }
}
