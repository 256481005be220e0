// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::Serialize;

/// What happened to a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventKind {
    Started,
    Finished,
    Blocked,
}

/// Progress event emitted for each tool call, rendered live by the UI.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEvent {
    #[serde(rename = "type")]
    pub kind: ToolEventKind,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

impl ToolEvent {
    pub fn started(command: impl Into<String>) -> Self {
        Self {
            kind: ToolEventKind::Started,
            command: command.into(),
            output: None,
            success: None,
            timestamp: Utc::now(),
        }
    }

    pub fn finished(command: impl Into<String>, output: impl Into<String>, success: bool) -> Self {
        Self {
            kind: ToolEventKind::Finished,
            command: command.into(),
            output: Some(output.into()),
            success: Some(success),
            timestamp: Utc::now(),
        }
    }

    pub fn blocked(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: ToolEventKind::Blocked,
            command: command.into(),
            output: Some(reason.into()),
            success: Some(false),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_has_no_output_or_success() {
        let e = ToolEvent::started("df -h");
        assert_eq!(e.kind, ToolEventKind::Started);
        assert!(e.output.is_none());
        assert!(e.success.is_none());
    }

    #[test]
    fn blocked_is_always_unsuccessful() {
        let e = ToolEvent::blocked("rm -rf /", "refused");
        assert_eq!(e.success, Some(false));
    }

    #[test]
    fn serializes_kind_under_type_key() {
        let e = ToolEvent::finished("ls", "ok", true);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "finished");
        assert_eq!(v["success"], true);
    }
}
