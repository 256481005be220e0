// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Errors produced by model providers.
///
/// [`ModelError::Aborted`] is the cooperative-cancellation sentinel: every
/// awaited model operation returns it promptly after its cancellation token
/// fires.  Callers treat it as "cancelled", never as a failure.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request aborted")]
    Aborted,

    #[error("rate limited: {hint}")]
    RateLimited { hint: String },

    #[error("model API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream idle for more than {0}s")]
    IdleTimeout(u64),

    #[error("provider configuration error: {0}")]
    Config(String),
}

impl ModelError {
    /// True for the cancellation sentinel.
    pub fn is_abort(&self) -> bool {
        matches!(self, ModelError::Aborted)
    }

    /// Short, user-presentable description for turn error reporting.
    pub fn user_hint(&self) -> String {
        match self {
            ModelError::RateLimited { hint } => {
                format!("the AI service is rate limiting requests — {hint}")
            }
            ModelError::Api { status, .. } => {
                format!("the AI service returned an error (HTTP {status})")
            }
            ModelError::Transport(_) => "could not reach the AI service".into(),
            ModelError::IdleTimeout(s) => {
                format!("the AI service stopped responding ({s}s without data)")
            }
            ModelError::Config(msg) => msg.clone(),
            ModelError::Aborted => "request cancelled".into(),
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        ModelError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_is_abort() {
        assert!(ModelError::Aborted.is_abort());
        assert!(!ModelError::Transport("x".into()).is_abort());
    }

    #[test]
    fn rate_limit_hint_mentions_rate_limiting() {
        let e = ModelError::RateLimited { hint: "retry in a minute".into() };
        assert!(e.user_hint().contains("rate limiting"));
    }
}
