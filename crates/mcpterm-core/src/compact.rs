// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `/compact`: replace all but the most recent buffer entries with one
//! LLM-generated summary, bounding the token cost of future turns.

use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mcpterm_model::{
    CompletionRequest, Message, ModelError, ModelProvider, ResponseEvent, Role, ToolChoice,
};
use mcpterm_store::{ConversationSummary, StoreError};

use crate::history::{BufferEntry, History};
use crate::prompts::SUMMARIZE_PROMPT;

/// Fewest buffer entries for which compaction is worthwhile.
pub const DEFAULT_MIN_MESSAGES: usize = 10;
/// The most recent entries are always kept verbatim.
pub const KEEP_RECENT: usize = 2;
/// Hard cap on the stored summary.
pub const SUMMARY_MAX_BYTES: usize = 50 * 1024;

#[derive(Debug, Error)]
pub enum CompactError {
    #[error("history too small to compact ({have} entries, need at least {need})")]
    TooSmall { have: usize, need: usize },

    #[error("model returned an empty summary")]
    EmptySummary,

    #[error("summary generation failed: {0}")]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Savings report shown to the user.  Token figures use the 4-chars-per-
/// token heuristic and are explicitly approximate — they never drive any
/// truncation decision.
#[derive(Debug, Clone)]
pub struct CompactReport {
    pub summarized: usize,
    pub kept: usize,
    pub chars_before: usize,
    pub chars_after: usize,
    pub approx_tokens_saved: usize,
    pub percent_saved: u32,
}

impl std::fmt::Display for CompactReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "compacted {} entries into a summary (kept last {}): \
             {} -> {} chars, ~{} tokens saved ({}% reduction, approximate)",
            self.summarized,
            self.kept,
            self.chars_before,
            self.chars_after,
            self.approx_tokens_saved,
            self.percent_saved,
        )
    }
}

/// Run the compaction flow against the current session buffer.
///
/// All but the last [`KEEP_RECENT`] entries are summarized; the summary is
/// upserted through the store and the buffer is rebuilt as
/// `[summary-as-system] ++ kept`.
pub async fn compact_history(
    history: &mut History,
    model: &dyn ModelProvider,
    min_messages: usize,
    max_tokens: u32,
    ai_token: CancellationToken,
) -> Result<CompactReport, CompactError> {
    let entries = history.entries();
    if entries.len() < min_messages {
        return Err(CompactError::TooSmall { have: entries.len(), need: min_messages });
    }

    let split = entries.len() - KEEP_RECENT;
    let to_summarize: Vec<BufferEntry> = entries[..split].to_vec();
    let keep: Vec<BufferEntry> = entries[split..].to_vec();
    let chars_before: usize = to_summarize.iter().map(|e| e.content.len()).sum();

    let req = CompletionRequest {
        system: Some(SUMMARIZE_PROMPT.to_string()),
        messages: vec![Message::user(serialize_entries(&to_summarize))],
        tools: vec![],
        tool_choice: ToolChoice::None,
        max_tokens,
        temperature: 0.3,
    };
    let mut stream = model.complete(req, ai_token).await?;

    let mut summary = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(delta) => summary.push_str(&delta),
            ResponseEvent::Done => break,
            ResponseEvent::Error(e) => warn!("summary stream warning: {e}"),
            _ => {}
        }
    }
    let summary = summary.trim().to_string();
    if summary.is_empty() {
        return Err(CompactError::EmptySummary);
    }
    let summary = cap_bytes(&summary, SUMMARY_MAX_BYTES);

    // The last summarized entry's id anchors the summary to a point in the
    // turn stream.
    let last_id = to_summarize
        .last()
        .map(|e| e.id.clone())
        .unwrap_or_default();
    history.store().upsert_summary(&ConversationSummary {
        user_id: history.user_id(),
        machine_id: history.machine_id().to_string(),
        summary: summary.clone(),
        summarized_up_to_message_id: last_id,
        message_count: to_summarize.len() as i64,
        updated_at: Utc::now().timestamp(),
    })?;

    history.rebuild_after_compact(&summary, keep);

    let chars_after = summary.len();
    let saved = chars_before.saturating_sub(chars_after);
    let percent_saved = if chars_before > 0 {
        (saved * 100 / chars_before) as u32
    } else {
        0
    };
    let report = CompactReport {
        summarized: to_summarize.len(),
        kept: KEEP_RECENT,
        chars_before,
        chars_after,
        approx_tokens_saved: saved / 4,
        percent_saved,
    };
    debug!(%report, "compaction complete");
    Ok(report)
}

/// Serialize buffer entries into role-labelled plain text for the
/// summarizer.
fn serialize_entries(entries: &[BufferEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let role = match e.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            format!("{role}: {}", e.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn cap_bytes(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut cut = limit;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s[..cut].to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use mcpterm_model::mock::ScriptedProvider;
    use mcpterm_store::LocalStore;

    fn seeded_history(turns: usize) -> History {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let mut h = History::new(store, None, "m1", "sess-1").unwrap();
        for i in 0..turns {
            let rid = format!("r{i}");
            h.begin_turn(&rid, &format!("question {i}")).unwrap();
            h.mark_processing(&rid).unwrap();
            h.complete_turn(&rid, &format!("answer {i}"), None, None).unwrap();
        }
        h
    }

    #[tokio::test]
    async fn rejects_history_below_minimum() {
        // 4 turns -> 8 entries, one below the minimum of 9.
        let mut h = seeded_history(4);
        let model = ScriptedProvider::always_text("## Summary");
        let err = compact_history(&mut h, &model, 9, 512, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CompactError::TooSmall { have: 8, need: 9 }));
        assert_eq!(h.len(), 8, "buffer unchanged on rejection");
    }

    #[tokio::test]
    async fn exactly_minimum_is_accepted() {
        let mut h = seeded_history(5); // 10 entries
        let model = ScriptedProvider::always_text("## Summary\n- five turns");
        let report = compact_history(&mut h, &model, 10, 512, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.summarized, 8);
        assert_eq!(h.len(), 3);
    }

    #[tokio::test]
    async fn twelve_turns_compact_to_summary_plus_last_two() {
        let mut h = seeded_history(6); // 12 entries
        let model = ScriptedProvider::always_text("## Session summary\n- trivia answered");
        let report = compact_history(&mut h, &model, 10, 512, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.summarized, 10);
        assert_eq!(report.kept, 2);
        assert_eq!(h.len(), 3);
        assert_eq!(h.entries()[0].role, Role::System);
        assert!(h.entries()[0].content.contains("Session summary"));
        // lastTwoTurns(H) == lastTwoTurns(H')
        assert_eq!(h.entries()[1].content, "question 5");
        assert_eq!(h.entries()[2].content, "answer 5");

        let row = h.store().read_summary(None, "m1").unwrap().unwrap();
        assert_eq!(row.message_count, 10);
        assert!(row.summary.contains("trivia answered"));

        // The next assembled context starts with the summary.
        let ctx = h.context_window();
        assert_eq!(ctx[0].role, Role::System);
        assert!(ctx[0].text().contains("Session summary"));
    }

    #[tokio::test]
    async fn recompacting_a_compacted_buffer_is_rejected() {
        let mut h = seeded_history(6);
        let model = ScriptedProvider::new(vec![
            ScriptedProvider::text_script("## First"),
            ScriptedProvider::text_script("## Second"),
        ]);
        compact_history(&mut h, &model, 10, 512, CancellationToken::new())
            .await
            .unwrap();
        let err = compact_history(&mut h, &model, 10, 512, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CompactError::TooSmall { have: 3, .. }));
    }

    #[tokio::test]
    async fn summary_is_capped_at_fifty_kilobytes() {
        let mut h = seeded_history(6);
        let huge = "x".repeat(SUMMARY_MAX_BYTES + 500);
        let model = ScriptedProvider::always_text(huge);
        compact_history(&mut h, &model, 10, 512, CancellationToken::new())
            .await
            .unwrap();
        let row = h.store().read_summary(None, "m1").unwrap().unwrap();
        assert_eq!(row.summary.len(), SUMMARY_MAX_BYTES);
    }

    #[tokio::test]
    async fn empty_summary_leaves_buffer_untouched() {
        let mut h = seeded_history(6);
        let model = ScriptedProvider::always_text("   ");
        let err = compact_history(&mut h, &model, 10, 512, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CompactError::EmptySummary));
        assert_eq!(h.len(), 12);
        assert!(h.store().read_summary(None, "m1").unwrap().is_none());
    }

    #[tokio::test]
    async fn summarizer_receives_no_tools() {
        let mut h = seeded_history(6);
        let model = ScriptedProvider::always_text("## Summary");
        compact_history(&mut h, &model, 10, 512, CancellationToken::new())
            .await
            .unwrap();
        let req = model.last_request.lock().unwrap().clone().unwrap();
        assert!(req.tools.is_empty());
        assert_eq!(req.tool_choice, ToolChoice::None);
        assert!(req.system.unwrap().contains("compaction assistant"));
    }

    #[test]
    fn serialize_labels_roles() {
        let entries = vec![
            BufferEntry {
                id: "1".into(),
                role: Role::User,
                content: "hi".into(),
                timestamp: Utc::now(),
                request_id: None,
            },
            BufferEntry {
                id: "2".into(),
                role: Role::Assistant,
                content: "hello".into(),
                timestamp: Utc::now(),
                request_id: None,
            },
        ];
        let text = serialize_entries(&entries);
        assert!(text.contains("User: hi"));
        assert!(text.contains("Assistant: hello"));
    }

    #[test]
    fn cap_bytes_respects_char_boundaries() {
        let s = "é".repeat(10);
        let capped = cap_bytes(&s, 5);
        assert!(capped.len() <= 5);
        assert!(capped.chars().all(|c| c == 'é'));
    }
}
