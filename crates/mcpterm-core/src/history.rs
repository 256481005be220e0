// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The authoritative in-memory conversation buffer for the current session,
//! plus the bookkeeping that keeps it consistent with the persisted turn
//! records: one user entry per submitted turn, one assistant entry per
//! answer, and exactly one system-role cancellation notice per cancelled
//! turn.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use mcpterm_model::{Message, Role};
use mcpterm_store::{LocalStore, NewTurn, StoreError, TurnPatch, TurnRecord, TurnStatus};

/// Fixed phrase appended as a system-role entry when the user cancels a
/// turn mid-flight.  The user's question stays in context; this notice
/// tells the model why no answer follows it.
pub const CANCELLED_NOTICE: &str =
    "The previous message was cancelled by the user before being answered.";

/// Assistant-role placeholder shown in the transcript when a cancelled turn
/// produced no partial text.  Filtered out of the model context — an
/// artificial assistant turn would only confuse the model.
pub const INTERRUPTION_MARKER: &str = "[response interrupted]";

/// One entry of the in-memory conversation buffer.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    /// Client-side id, stable from creation; summaries reference it.
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
}

impl BufferEntry {
    fn new(role: Role, content: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            request_id,
        }
    }
}

/// Conversation-history model: owns the buffer (single writer) and persists
/// every turn through the local store.
pub struct History {
    store: Arc<LocalStore>,
    user_id: Option<i64>,
    machine_id: String,
    session_id: String,
    buffer: Vec<BufferEntry>,
    /// Request id of the last cancellation notice, so rapid repeat
    /// cancellations of the same turn never produce duplicate markers.
    last_marker_request: Option<String>,
}

impl History {
    /// Build the session history.  A persisted summary for (user, machine)
    /// becomes the leading system entry so the assembled context always
    /// starts with it.
    pub fn new(
        store: Arc<LocalStore>,
        user_id: Option<i64>,
        machine_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let machine_id = machine_id.into();
        let mut buffer = Vec::new();
        if let Some(summary) = store.read_summary(user_id, &machine_id)? {
            buffer.push(BufferEntry::new(
                Role::System,
                format!("Prior conversation summary:\n\n{}", summary.summary),
                None,
            ));
        }
        Ok(Self {
            store,
            user_id,
            machine_id,
            session_id: session_id.into(),
            buffer,
            last_marker_request: None,
        })
    }

    pub fn entries(&self) -> &[BufferEntry] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Point subsequent turns at a new session row (after an idle-timeout
    /// closure).  The buffer carries over — the conversation continues.
    pub fn set_session(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Record the user turn (status=pending) and append it to the buffer.
    /// Returns the client-side turn id.
    pub fn begin_turn(&mut self, request_id: &str, command: &str) -> Result<String, StoreError> {
        let entry = BufferEntry::new(Role::User, command, Some(request_id.to_string()));
        let id = entry.id.clone();
        self.store.record_turn(NewTurn {
            id: id.clone(),
            command: command.to_string(),
            user_id: self.user_id,
            machine_id: self.machine_id.clone(),
            session_id: Some(self.session_id.clone()),
            timestamp: Utc::now().timestamp(),
            request_id: request_id.to_string(),
            context: None,
        })?;
        self.buffer.push(entry);
        Ok(id)
    }

    pub fn mark_processing(&self, request_id: &str) -> Result<(), StoreError> {
        self.store
            .update_turn(
                request_id,
                TurnPatch { status: Some(TurnStatus::Processing), ..Default::default() },
            )
            .map(|_| ())
    }

    /// Persist the answer and append it to the buffer.  Also bumps the
    /// per-machine and per-session command counters.
    pub fn complete_turn(
        &mut self,
        request_id: &str,
        response: &str,
        tokens_used: Option<i64>,
        execution_time_ms: Option<i64>,
    ) -> Result<TurnRecord, StoreError> {
        let record = self.store.update_turn(
            request_id,
            TurnPatch {
                status: Some(TurnStatus::Completed),
                response: Some(response.to_string()),
                tokens_used,
                execution_time_ms,
                ..Default::default()
            },
        )?;
        self.buffer.push(BufferEntry::new(
            Role::Assistant,
            response,
            Some(request_id.to_string()),
        ));
        self.store.increment_machine_commands(&self.machine_id)?;
        self.store.bump_session_commands(&self.session_id)?;
        Ok(record)
    }

    /// Persist a failed turn.  The error stays out of the model context;
    /// the interaction loop shows it once and the next turn proceeds
    /// normally.
    pub fn fail_turn(
        &mut self,
        request_id: &str,
        error_code: &str,
        message: &str,
    ) -> Result<TurnRecord, StoreError> {
        self.store.update_turn(
            request_id,
            TurnPatch {
                status: Some(TurnStatus::Error),
                response: Some(message.to_string()),
                error_code: Some(error_code.to_string()),
                ..Default::default()
            },
        )
    }

    /// Persist a cancelled turn and append the cancellation bookkeeping:
    /// the partial answer (when any text was streamed) or an interruption
    /// placeholder, followed by at most one system-role notice.
    ///
    /// Returns true when a notice was appended; repeat cancellations of the
    /// same turn return false and change nothing.
    pub fn cancel_turn(
        &mut self,
        request_id: &str,
        partial: Option<&str>,
    ) -> Result<bool, StoreError> {
        if self.last_marker_request.as_deref() == Some(request_id) {
            return Ok(false);
        }

        let partial = partial.filter(|p| !p.is_empty());
        self.store.update_turn(
            request_id,
            TurnPatch {
                status: Some(TurnStatus::Cancelled),
                response: partial.map(str::to_string),
                ..Default::default()
            },
        )?;

        match partial {
            Some(text) => self.buffer.push(BufferEntry::new(
                Role::Assistant,
                text,
                Some(request_id.to_string()),
            )),
            None => self.buffer.push(BufferEntry::new(
                Role::Assistant,
                INTERRUPTION_MARKER,
                Some(request_id.to_string()),
            )),
        }
        self.buffer.push(BufferEntry::new(
            Role::System,
            CANCELLED_NOTICE,
            Some(request_id.to_string()),
        ));
        self.last_marker_request = Some(request_id.to_string());
        debug!(request_id, "cancellation notice appended");
        Ok(true)
    }

    /// Assemble the message list for the model.
    ///
    /// Buffer order is preserved; the leading summary entry (when present)
    /// is already first.  User entries survive even when their turn was
    /// cancelled — the intent is still context.  Only assistant-role
    /// interruption placeholders are dropped.
    pub fn context_window(&self) -> Vec<Message> {
        self.buffer
            .iter()
            .filter(|e| !(e.role == Role::Assistant && e.content == INTERRUPTION_MARKER))
            .map(|e| Message {
                role: e.role,
                content: vec![mcpterm_model::ContentBlock::Text { text: e.content.clone() }],
            })
            .collect()
    }

    /// Replace the buffer after compaction: the new summary as a single
    /// system entry, followed by the preserved tail.
    pub fn rebuild_after_compact(&mut self, summary_text: &str, keep: Vec<BufferEntry>) {
        let mut buffer = Vec::with_capacity(keep.len() + 1);
        buffer.push(BufferEntry::new(
            Role::System,
            format!("Prior conversation summary:\n\n{summary_text}"),
            None,
        ));
        buffer.extend(keep);
        self.buffer = buffer;
    }

    /// Wipe the in-memory buffer (the `/clear` command).  Persisted turns
    /// are untouched.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_marker_request = None;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
