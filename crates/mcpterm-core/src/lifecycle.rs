// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Request lifecycle manager: one record per in-flight AI/DB operation, with
//! two independent cancellation tokens.
//!
//! Single-writer by construction: the interaction loop owns the manager and
//! is the only mutator.  The AI token is handed to the model provider; the
//! DB token bounds the sync worker's retry loops.  Neither token is ever
//! re-signalled after its request completes.

use std::collections::HashMap;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Queued,
    AiInflight,
    DbInflight,
    Done,
}

/// What `begin` hands to the caller: the id plus the two tokens to thread
/// through the AI call and the DB retry loop.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    pub request_id: String,
    pub ai_token: CancellationToken,
    pub db_token: CancellationToken,
}

struct RequestRecord {
    kind: RequestKind,
    started_at: Instant,
    ai_token: CancellationToken,
    db_token: CancellationToken,
    phase: Phase,
    cancel_fired: bool,
}

#[derive(Default)]
pub struct RequestLifecycle {
    records: HashMap<String, RequestRecord>,
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id and its cancellation tokens, phase = queued.
    ///
    /// The at-most-one-active invariant is enforced by the caller (the
    /// interaction loop refuses to submit while processing); a violation
    /// here is a bug, so it is logged loudly rather than masked.
    pub fn begin(&mut self, kind: RequestKind) -> RequestHandle {
        if let Some(active) = self.active_request() {
            warn!(active = %active, "begin() while another request is active");
        }
        let request_id = Uuid::new_v4().to_string();
        let ai_token = CancellationToken::new();
        let db_token = CancellationToken::new();
        self.records.insert(
            request_id.clone(),
            RequestRecord {
                kind,
                started_at: Instant::now(),
                ai_token: ai_token.clone(),
                db_token: db_token.clone(),
                phase: Phase::Queued,
                cancel_fired: false,
            },
        );
        debug!(request_id = %request_id, ?kind, "request begun");
        RequestHandle { request_id, ai_token, db_token }
    }

    pub fn set_phase(&mut self, request_id: &str, phase: Phase) {
        if let Some(r) = self.records.get_mut(request_id) {
            r.phase = phase;
        }
    }

    /// Signal both tokens of a request.  Idempotent: only the first call
    /// fires, and a completed request is never re-signalled.  Returns
    /// whether cancellation actually fired.
    pub fn cancel(&mut self, request_id: &str, reason: &str) -> bool {
        let Some(r) = self.records.get_mut(request_id) else {
            return false;
        };
        if r.cancel_fired || r.phase == Phase::Done {
            return false;
        }
        r.cancel_fired = true;
        r.ai_token.cancel();
        r.db_token.cancel();
        debug!(request_id = %request_id, reason, "request cancelled");
        true
    }

    /// Cancel every request not yet done.  Returns how many fired.
    pub fn cancel_all(&mut self, reason: &str) -> usize {
        let ids: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.phase != Phase::Done && !r.cancel_fired)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter(|id| self.cancel(id, reason)).count()
    }

    /// Mark a request done and release its tokens.
    pub fn complete(&mut self, request_id: &str) {
        if let Some(r) = self.records.get_mut(request_id) {
            r.phase = Phase::Done;
            debug!(
                request_id = %request_id,
                elapsed_ms = r.started_at.elapsed().as_millis() as u64,
                "request complete"
            );
        }
    }

    /// The id of the request currently in flight, if any.
    pub fn active_request(&self) -> Option<&str> {
        self.records
            .iter()
            .find(|(_, r)| r.phase != Phase::Done)
            .map(|(id, _)| id.as_str())
    }

    pub fn phase(&self, request_id: &str) -> Option<Phase> {
        self.records.get(request_id).map(|r| r.phase)
    }

    pub fn kind(&self, request_id: &str) -> Option<RequestKind> {
        self.records.get(request_id).map(|r| r.kind)
    }

    pub fn was_cancelled(&self, request_id: &str) -> bool {
        self.records
            .get(request_id)
            .is_some_and(|r| r.cancel_fired)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
