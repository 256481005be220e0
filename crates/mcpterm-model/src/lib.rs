// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod anthropic;
mod error;
pub mod mock;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use error::ModelError;
pub use provider::{abortable, with_idle_timeout, ModelProvider, ResponseStream};
pub use types::{
    CompletionRequest, ContentBlock, Message, ResponseEvent, Role, StopReason, ToolChoice,
    ToolSchema,
};
