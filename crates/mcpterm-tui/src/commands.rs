// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Special-command parsing.  Pure functions; the app executes the result.

/// Actions reachable through `/commands`.  None of them call the LLM
/// except `/compact`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialCommand {
    Help,
    Clear,
    History,
    Status,
    ToggleDebug,
    Exit,
    Compact,
    Unknown(String),
}

/// Parse an input line as a special command.  Returns `None` when the line
/// does not start with `/` (i.e. it is a question for the assistant).
pub fn parse_command(input: &str) -> Option<SpecialCommand> {
    let trimmed = input.trim();
    let body = trimmed.strip_prefix('/')?;
    let name = body.split_whitespace().next().unwrap_or("");
    Some(match name {
        "help" => SpecialCommand::Help,
        "clear" => SpecialCommand::Clear,
        "history" => SpecialCommand::History,
        "status" => SpecialCommand::Status,
        "debug" => SpecialCommand::ToggleDebug,
        "exit" | "quit" => SpecialCommand::Exit,
        "compact" => SpecialCommand::Compact,
        other => SpecialCommand::Unknown(other.to_string()),
    })
}

pub fn help_text() -> String {
    "Available commands:\n\
     /help     show this help\n\
     /clear    clear the screen and the conversation buffer\n\
     /history  show recent turns on this machine\n\
     /status   connection, session, and sync state\n\
     /debug    toggle verbose logging\n\
     /compact  summarize older conversation to save context\n\
     /exit     quit (alias: /quit)\n\
     \n\
     Esc cancels the current request; Ctrl-C twice (or Ctrl-D) exits."
        .to_string()
}

/// Remove bracketed-paste framing (CSI 200~ / CSI 201~) from pasted text.
/// Terminals that support the mode wrap every paste in these markers so the
/// loop can tell pasting from typing.
pub fn strip_paste_markers(s: &str) -> String {
    s.replace("\x1b[200~", "").replace("\x1b[201~", "")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_slash_input_is_not_a_command() {
        assert_eq!(parse_command("how are you"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("help"), None);
    }

    #[test]
    fn known_commands_parse() {
        assert_eq!(parse_command("/help"), Some(SpecialCommand::Help));
        assert_eq!(parse_command("/clear"), Some(SpecialCommand::Clear));
        assert_eq!(parse_command("/history"), Some(SpecialCommand::History));
        assert_eq!(parse_command("/status"), Some(SpecialCommand::Status));
        assert_eq!(parse_command("/debug"), Some(SpecialCommand::ToggleDebug));
        assert_eq!(parse_command("/compact"), Some(SpecialCommand::Compact));
    }

    #[test]
    fn exit_has_quit_alias() {
        assert_eq!(parse_command("/exit"), Some(SpecialCommand::Exit));
        assert_eq!(parse_command("/quit"), Some(SpecialCommand::Exit));
    }

    #[test]
    fn unknown_command_carries_its_name() {
        assert_eq!(
            parse_command("/frobnicate now"),
            Some(SpecialCommand::Unknown("frobnicate".into()))
        );
    }

    #[test]
    fn surrounding_whitespace_is_tolerated() {
        assert_eq!(parse_command("  /help  "), Some(SpecialCommand::Help));
    }

    #[test]
    fn help_text_lists_available_commands() {
        let text = help_text();
        assert!(text.contains("Available commands"));
        for cmd in ["/help", "/clear", "/history", "/status", "/debug", "/compact", "/exit"] {
            assert!(text.contains(cmd), "{cmd} missing from help");
        }
    }

    #[test]
    fn paste_markers_are_stripped() {
        let pasted = "\x1b[200~df -h\nfree -m\x1b[201~";
        assert_eq!(strip_paste_markers(pasted), "df -h\nfree -m");
    }

    #[test]
    fn text_without_markers_is_unchanged() {
        assert_eq!(strip_paste_markers("plain"), "plain");
    }
}
