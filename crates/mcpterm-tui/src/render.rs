// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Minimal inline renderer for raw-mode terminals.
//!
//! The layout is a rolling transcript with a single prompt line at the
//! bottom.  Output lines are printed above the prompt; the prompt is
//! redrawn after every state change.  In raw mode `\n` does not return the
//! carriage, so all output goes through [`Screen::print`].

use std::io::{self, Stdout, Write};

use crossterm::{
    cursor::MoveToColumn,
    execute,
    style::Print,
    terminal::{Clear, ClearType},
};

const PROMPT: &str = "❯ ";

pub struct Screen {
    out: Stdout,
}

impl Screen {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }

    /// Print a block of text above the prompt, converting `\n` to `\r\n`.
    pub fn print(&mut self, text: &str) -> io::Result<()> {
        let normalized = text.replace('\n', "\r\n");
        execute!(self.out, Print(normalized))?;
        self.out.flush()
    }

    /// Print a full line (with trailing newline).
    pub fn print_line(&mut self, text: &str) -> io::Result<()> {
        self.print(text)?;
        self.print("\n")
    }

    /// Clear the current line and draw the prompt with the input buffer,
    /// placing the terminal cursor at the logical cursor position.
    pub fn draw_prompt(&mut self, input: &str, cursor_chars: usize) -> io::Result<()> {
        execute!(
            self.out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(PROMPT),
            Print(input),
        )?;
        let prompt_width = PROMPT.chars().count() as u16;
        execute!(self.out, MoveToColumn(prompt_width + cursor_chars as u16))?;
        self.out.flush()
    }

    /// Erase the prompt line so output can be printed in its place.
    pub fn clear_prompt_line(&mut self) -> io::Result<()> {
        execute!(self.out, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        self.out.flush()
    }

    pub fn clear_screen(&mut self) -> io::Result<()> {
        execute!(
            self.out,
            Clear(ClearType::All),
            crossterm::cursor::MoveTo(0, 0)
        )?;
        self.out.flush()
    }
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}
