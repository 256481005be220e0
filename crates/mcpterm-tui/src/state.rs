// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Instant;

use mcpterm_tools::events::ToolEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Initializing,
    Ready,
    Processing,
    Error,
}

/// Observable state of the interaction loop.  Mutated only from event
/// handlers; render paths read it.
pub struct AppState {
    // core
    pub input: String,
    /// Cursor position in characters (not bytes).
    pub cursor: usize,
    pub status: AppStatus,
    pub response: String,
    pub error: Option<String>,
    pub is_processing: bool,
    pub is_cancelled: bool,
    pub execution_log: Vec<ToolEvent>,

    // history
    pub command_history: Vec<String>,
    pub history_index: Option<usize>,
    /// What was typed before history navigation started, restored when the
    /// user scrolls back past the newest entry.
    draft: String,

    // ui
    pub last_ctrl_c: Option<Instant>,
    pub last_esc: Option<Instant>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            input: String::new(),
            cursor: 0,
            status: AppStatus::Initializing,
            response: String::new(),
            error: None,
            is_processing: false,
            is_cancelled: false,
            execution_log: Vec::new(),
            command_history: Vec::new(),
            history_index: None,
            draft: String::new(),
            last_ctrl_c: None,
            last_esc: None,
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.input
            .char_indices()
            .nth(chars)
            .map(|(i, _)| i)
            .unwrap_or(self.input.len())
    }

    pub fn char_len(&self) -> usize {
        self.input.chars().count()
    }

    pub fn insert_char(&mut self, c: char) {
        let at = self.byte_offset(self.cursor);
        self.input.insert(at, c);
        self.cursor += 1;
    }

    /// Insert pasted text as a single block at the cursor.
    pub fn insert_str(&mut self, s: &str) {
        let at = self.byte_offset(self.cursor);
        self.input.insert_str(at, s);
        self.cursor += s.chars().count();
    }

    pub fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let at = self.byte_offset(self.cursor - 1);
        self.input.remove(at);
        self.cursor -= 1;
    }

    pub fn cursor_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn cursor_right(&mut self) {
        if self.cursor < self.char_len() {
            self.cursor += 1;
        }
    }

    /// Replace a trailing line-continuation backslash with a newline,
    /// leaving the cursor at the end of the (now multi-line) input.
    pub fn continue_line(&mut self) {
        if self.input.ends_with('\\') {
            self.input.pop();
            self.input.push('\n');
        }
        self.cursor = self.char_len();
    }

    pub fn clear_input(&mut self) {
        self.input.clear();
        self.cursor = 0;
        self.history_index = None;
    }

    /// Take the submitted line, resetting input state.
    pub fn take_input(&mut self) -> String {
        self.history_index = None;
        self.cursor = 0;
        std::mem::take(&mut self.input)
    }

    /// Append a submitted command for ↑/↓ recall.  Consecutive duplicates
    /// collapse.
    pub fn push_command_history(&mut self, command: &str) {
        if self.command_history.last().map(String::as_str) != Some(command) {
            self.command_history.push(command.to_string());
        }
        self.history_index = None;
    }

    /// ↑: walk backwards through past commands, saving the current draft on
    /// first use.  The index is preserved across successive presses.
    pub fn history_prev(&mut self) {
        if self.command_history.is_empty() {
            return;
        }
        let next = match self.history_index {
            None => {
                self.draft = self.input.clone();
                self.command_history.len() - 1
            }
            Some(0) => 0,
            Some(i) => i - 1,
        };
        self.history_index = Some(next);
        self.input = self.command_history[next].clone();
        self.cursor = self.char_len();
    }

    /// ↓: walk forward; past the newest entry the saved draft comes back.
    pub fn history_next(&mut self) {
        let Some(i) = self.history_index else {
            return;
        };
        if i + 1 < self.command_history.len() {
            self.history_index = Some(i + 1);
            self.input = self.command_history[i + 1].clone();
        } else {
            self.history_index = None;
            self.input = std::mem::take(&mut self.draft);
        }
        self.cursor = self.char_len();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_backspace_at_cursor() {
        let mut s = AppState::new();
        for c in "abc".chars() {
            s.insert_char(c);
        }
        s.cursor_left();
        s.insert_char('X');
        assert_eq!(s.input, "abXc");
        s.backspace();
        assert_eq!(s.input, "abc");
        assert_eq!(s.cursor, 2);
    }

    #[test]
    fn cursor_movement_is_bounded() {
        let mut s = AppState::new();
        s.cursor_left();
        assert_eq!(s.cursor, 0);
        s.insert_char('a');
        s.cursor_right();
        assert_eq!(s.cursor, 1);
    }

    #[test]
    fn multibyte_input_is_handled_by_chars() {
        let mut s = AppState::new();
        s.insert_str("héllo");
        assert_eq!(s.cursor, 5);
        s.backspace();
        assert_eq!(s.input, "héll");
    }

    #[test]
    fn take_input_resets_state() {
        let mut s = AppState::new();
        s.insert_str("df -h");
        let taken = s.take_input();
        assert_eq!(taken, "df -h");
        assert!(s.input.is_empty());
        assert_eq!(s.cursor, 0);
    }

    #[test]
    fn history_recall_cycles_and_preserves_index() {
        let mut s = AppState::new();
        s.push_command_history("first");
        s.push_command_history("second");

        s.history_prev();
        assert_eq!(s.input, "second");
        s.history_prev();
        assert_eq!(s.input, "first");
        // At the oldest entry ↑ stays put.
        s.history_prev();
        assert_eq!(s.input, "first");

        s.history_next();
        assert_eq!(s.input, "second");
    }

    #[test]
    fn history_next_past_newest_restores_draft() {
        let mut s = AppState::new();
        s.push_command_history("old command");
        s.insert_str("half typed");
        s.history_prev();
        assert_eq!(s.input, "old command");
        s.history_next();
        assert_eq!(s.input, "half typed");
        assert_eq!(s.history_index, None);
    }

    #[test]
    fn consecutive_duplicate_commands_collapse() {
        let mut s = AppState::new();
        s.push_command_history("df -h");
        s.push_command_history("df -h");
        s.push_command_history("free -m");
        assert_eq!(s.command_history.len(), 2);
    }

    #[test]
    fn continue_line_swaps_backslash_for_newline() {
        let mut s = AppState::new();
        s.insert_str("first line\\");
        s.continue_line();
        assert_eq!(s.input, "first line\n");
        assert_eq!(s.cursor, s.char_len());
    }

    #[test]
    fn history_next_without_navigation_is_a_no_op() {
        let mut s = AppState::new();
        s.insert_str("typed");
        s.history_next();
        assert_eq!(s.input, "typed");
    }
}
