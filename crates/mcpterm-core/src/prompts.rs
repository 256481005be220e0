// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System and summarizer prompts.

/// Base system prompt for the interactive assistant.
const SYSTEM_PROMPT: &str = "\
You are a Linux/Unix system administration assistant running inside a \
terminal on the user's machine. You answer questions about this machine \
and perform inspections on it.

When the bash tool is available, prefer observing the real system over \
guessing: run the commands needed to answer precisely. Issue independent \
commands as parallel tool calls in the same turn. Keep final answers short \
and concrete — name the actual filesystems, services, and values you found.

When you cannot run commands, answer from general knowledge and say what \
you would check.";

/// Build the system prompt, with optional host context appended.
pub fn system_prompt(host_context: Option<&str>) -> String {
    match host_context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("{SYSTEM_PROMPT}\n\n# Host\n{ctx}")
        }
        _ => SYSTEM_PROMPT.to_string(),
    }
}

/// Prompt for `/compact` summaries.
///
/// The contract: emphasise actions taken, decisions made, errors resolved,
/// and the resulting system state; de-emphasise the literal shell commands.
/// Output is Markdown with a single `##` title, `-` bullet lists, and
/// inline code for paths and values.
pub const SUMMARIZE_PROMPT: &str = "\
You are a conversation compaction assistant for a terminal assistant. \
Summarise the conversation history below so it can replace the original \
messages as context for future turns.

Focus on:
- actions taken on the system and their outcomes
- decisions made and why
- errors encountered and how they were resolved
- the resulting state of the machine

Do not reproduce long command transcripts; name what was done, not every \
command that did it.

Format: Markdown with exactly one `##` title line, bullet lists using `-`, \
and inline code for file paths, service names, and values.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_without_context_is_base() {
        let p = system_prompt(None);
        assert!(p.contains("system administration assistant"));
        assert!(!p.contains("# Host"));
    }

    #[test]
    fn system_prompt_appends_host_context() {
        let p = system_prompt(Some("hostname: web01\nos: Ubuntu 24.04"));
        assert!(p.contains("# Host"));
        assert!(p.contains("web01"));
    }

    #[test]
    fn blank_host_context_is_ignored() {
        assert_eq!(system_prompt(Some("  ")), system_prompt(None));
    }
}
