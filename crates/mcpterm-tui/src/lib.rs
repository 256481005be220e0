// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod app;
mod commands;
mod keys;
mod render;
mod state;

pub use app::{App, AppOptions};
pub use commands::{help_text, parse_command, strip_paste_markers, SpecialCommand};
pub use keys::{map_key, Action};
pub use state::{AppState, AppStatus};
