// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// Logical actions the interaction loop can perform, independent of key
/// binding.  The app decides context (e.g. Esc cancels while processing,
/// clears the input when idle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Insert(char),
    Backspace,
    CursorLeft,
    CursorRight,
    HistoryPrev,
    HistoryNext,
    Submit,
    /// Esc: cancel the in-flight request, or clear the input when idle.
    Escape,
    /// Ctrl-C: exit on the second press within the grace window.
    CtrlC,
    /// Ctrl-D: clean exit.
    CtrlD,
}

/// Map a raw key event to an [`Action`].  Pure, single-threaded decoding.
pub fn map_key(event: &KeyEvent) -> Option<Action> {
    let ctrl = event.modifiers.contains(KeyModifiers::CONTROL);
    let alt = event.modifiers.contains(KeyModifiers::ALT);

    match event.code {
        KeyCode::Char('c') if ctrl => Some(Action::CtrlC),
        KeyCode::Char('d') if ctrl => Some(Action::CtrlD),
        KeyCode::Esc => Some(Action::Escape),
        KeyCode::Enter => Some(Action::Submit),
        KeyCode::Backspace => Some(Action::Backspace),
        KeyCode::Left => Some(Action::CursorLeft),
        KeyCode::Right => Some(Action::CursorRight),
        KeyCode::Up => Some(Action::HistoryPrev),
        KeyCode::Down => Some(Action::HistoryNext),
        // Printable characters only when no control modifier would make
        // them a control sequence.
        KeyCode::Char(c) if !ctrl && !alt => Some(Action::Insert(c)),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crossterm::event::{KeyEventKind, KeyEventState};

    use super::*;

    fn key(code: KeyCode, mods: KeyModifiers) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: mods,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    #[test]
    fn plain_char_inserts() {
        assert_eq!(
            map_key(&key(KeyCode::Char('x'), KeyModifiers::NONE)),
            Some(Action::Insert('x'))
        );
    }

    #[test]
    fn shifted_char_still_inserts() {
        assert_eq!(
            map_key(&key(KeyCode::Char('X'), KeyModifiers::SHIFT)),
            Some(Action::Insert('X'))
        );
    }

    #[test]
    fn ctrl_char_does_not_insert() {
        assert_eq!(
            map_key(&key(KeyCode::Char('x'), KeyModifiers::CONTROL)),
            None
        );
    }

    #[test]
    fn ctrl_c_and_ctrl_d_map_to_exit_actions() {
        assert_eq!(
            map_key(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Action::CtrlC)
        );
        assert_eq!(
            map_key(&key(KeyCode::Char('d'), KeyModifiers::CONTROL)),
            Some(Action::CtrlD)
        );
    }

    #[test]
    fn navigation_keys_map() {
        assert_eq!(map_key(&key(KeyCode::Left, KeyModifiers::NONE)), Some(Action::CursorLeft));
        assert_eq!(map_key(&key(KeyCode::Right, KeyModifiers::NONE)), Some(Action::CursorRight));
        assert_eq!(map_key(&key(KeyCode::Up, KeyModifiers::NONE)), Some(Action::HistoryPrev));
        assert_eq!(map_key(&key(KeyCode::Down, KeyModifiers::NONE)), Some(Action::HistoryNext));
    }

    #[test]
    fn enter_submits_and_esc_escapes() {
        assert_eq!(map_key(&key(KeyCode::Enter, KeyModifiers::NONE)), Some(Action::Submit));
        assert_eq!(map_key(&key(KeyCode::Esc, KeyModifiers::NONE)), Some(Action::Escape));
    }

    #[test]
    fn unbound_keys_map_to_none() {
        assert_eq!(map_key(&key(KeyCode::F(5), KeyModifiers::NONE)), None);
        assert_eq!(map_key(&key(KeyCode::Tab, KeyModifiers::NONE)), None);
    }
}
