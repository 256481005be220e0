// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{CompletionRequest, ModelError, ResponseEvent};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResponseEvent, ModelError>> + Send>>;

/// A streaming chat-completion backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;

    /// Whether this provider accepts native tool definitions.  Providers
    /// without tool support degrade the orchestrator to a single plain
    /// completion.
    fn supports_tools(&self) -> bool {
        true
    }

    /// Start a completion.  The returned stream must end with
    /// [`ResponseEvent::Done`] on success and must resolve to
    /// [`ModelError::Aborted`] within one scheduler tick of `abort` firing.
    async fn complete(
        &self,
        req: CompletionRequest,
        abort: CancellationToken,
    ) -> Result<ResponseStream, ModelError>;
}

/// Wrap a stream so that it yields `Err(ModelError::Aborted)` and then ends
/// as soon as `token` is cancelled, regardless of the inner stream's state.
///
/// Cancellation wins over a ready inner item (`biased`) so an abort is
/// observed promptly even on a fast-producing stream.
pub fn abortable(inner: ResponseStream, token: CancellationToken) -> ResponseStream {
    let stream = futures::stream::unfold(
        (inner, token, false),
        |(mut inner, token, done)| async move {
            if done {
                return None;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    Some((Err(ModelError::Aborted), (inner, token, true)))
                }
                item = inner.next() => {
                    item.map(|i| (i, (inner, token, false)))
                }
            }
        },
    );
    Box::pin(stream)
}

/// Wrap a stream with a per-chunk idle timeout.  When no event arrives for
/// `idle` the stream yields `Err(ModelError::IdleTimeout)` and ends.
pub fn with_idle_timeout(inner: ResponseStream, idle: Duration) -> ResponseStream {
    let secs = idle.as_secs();
    let stream = futures::stream::unfold(
        (inner, false),
        move |(mut inner, done)| async move {
            if done {
                return None;
            }
            match tokio::time::timeout(idle, inner.next()).await {
                Ok(item) => item.map(|i| (i, (inner, false))),
                Err(_) => Some((Err(ModelError::IdleTimeout(secs)), (inner, true))),
            }
        },
    );
    Box::pin(stream)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text_stream(items: Vec<&str>) -> ResponseStream {
        let events: Vec<Result<ResponseEvent, ModelError>> = items
            .into_iter()
            .map(|t| Ok(ResponseEvent::TextDelta(t.to_string())))
            .collect();
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn abortable_passes_items_through_when_not_cancelled() {
        let token = CancellationToken::new();
        let mut s = abortable(text_stream(vec!["a", "b"]), token);
        assert!(matches!(
            s.next().await,
            Some(Ok(ResponseEvent::TextDelta(t))) if t == "a"
        ));
        assert!(matches!(
            s.next().await,
            Some(Ok(ResponseEvent::TextDelta(t))) if t == "b"
        ));
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn abortable_yields_aborted_then_ends_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let mut s = abortable(text_stream(vec!["a"]), token);
        assert!(matches!(s.next().await, Some(Err(ModelError::Aborted))));
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn abortable_on_pending_stream_resolves_on_cancel() {
        let token = CancellationToken::new();
        let mut s = abortable(Box::pin(futures::stream::pending()), token.clone());
        let next = tokio::spawn(async move { s.next().await });
        token.cancel();
        let item = next.await.unwrap();
        assert!(matches!(item, Some(Err(ModelError::Aborted))));
    }

    #[tokio::test]
    async fn idle_timeout_fires_on_silent_stream() {
        let mut s = with_idle_timeout(
            Box::pin(futures::stream::pending()),
            Duration::from_millis(10),
        );
        assert!(matches!(s.next().await, Some(Err(ModelError::IdleTimeout(_)))));
        assert!(s.next().await.is_none());
    }
}
