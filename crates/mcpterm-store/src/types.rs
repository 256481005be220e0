// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Turn status ──────────────────────────────────────────────────────────────

/// Lifecycle state of a persisted turn.
///
/// Transitions are monotonic: `Pending → Processing → terminal`, with
/// cancellation allowed from either non-terminal state.  Terminal states
/// (`Completed`, `Cancelled`, `Error`) never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Error,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Processing => "processing",
            TurnStatus::Completed => "completed",
            TurnStatus::Cancelled => "cancelled",
            TurnStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }

    /// Whether moving from `self` to `to` preserves monotonicity.
    pub fn can_transition(&self, to: TurnStatus) -> bool {
        match self {
            TurnStatus::Pending => to != TurnStatus::Pending,
            TurnStatus::Processing => to.is_terminal(),
            _ => false,
        }
    }
}

// ─── Records ──────────────────────────────────────────────────────────────────

/// A fully materialized turn row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub command: String,
    pub response: Option<String>,
    pub user_id: Option<i64>,
    pub machine_id: String,
    pub session_id: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
    pub status: TurnStatus,
    pub request_id: String,
    pub updated_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub tokens_used: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub error_code: Option<String>,
    pub context: Option<String>,
}

impl TurnRecord {
    /// The instant used for last-writer-wins conflict resolution.
    pub fn lww_stamp(&self) -> i64 {
        self.updated_at.unwrap_or(self.timestamp)
    }
}

/// Fields required to insert a turn.  `response` starts null and `status`
/// starts pending; neither is part of the insert surface.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub id: String,
    pub command: String,
    pub user_id: Option<i64>,
    pub machine_id: String,
    pub session_id: Option<String>,
    pub timestamp: i64,
    pub request_id: String,
    pub context: Option<String>,
}

/// Mutable fields of a turn.  Immutable fields (`command`, `request_id`,
/// identity, `timestamp`) are not representable here, so an update cannot
/// touch them.
#[derive(Debug, Clone, Default)]
pub struct TurnPatch {
    pub status: Option<TurnStatus>,
    pub response: Option<String>,
    pub tokens_used: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub error_code: Option<String>,
}

/// One of the three views of turn history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    Global,
    User(i64),
    Machine(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub created_at: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub machine_id: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub os_info: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub total_commands: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub machine_id: String,
    pub user_id: Option<i64>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub command_count: i64,
}

/// Rolling summary of prior conversation for one (user, machine) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub user_id: Option<i64>,
    pub machine_id: String,
    pub summary: String,
    pub summarized_up_to_message_id: String,
    pub message_count: i64,
    pub updated_at: i64,
}

/// Cached output of an idempotent shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCacheEntry {
    pub hash: String,
    pub command: String,
    pub output: String,
    pub machine_id: Option<String>,
    pub last_executed: i64,
    pub execution_count: i64,
    pub avg_execution_time_ms: i64,
}

// ─── Sync queue payloads ──────────────────────────────────────────────────────

/// One outbound replication operation, serialized into the sync queue.
///
/// Turn inserts and updates both travel as full-row upserts so that replays
/// and last-writer-wins merging need no op ordering beyond queue order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncOp {
    UpsertTurn(TurnRecord),
    UpsertSummary(ConversationSummary),
    UpsertMachine(MachineInfo),
    UpsertSession(SessionRow),
    CachePut(CommandCacheEntry),
}

impl SyncOp {
    /// Stable id of the record this op concerns (for queue bookkeeping).
    pub fn record_id(&self) -> &str {
        match self {
            SyncOp::UpsertTurn(t) => &t.id,
            SyncOp::UpsertSummary(s) => &s.machine_id,
            SyncOp::UpsertMachine(m) => &m.machine_id,
            SyncOp::UpsertSession(s) => &s.id,
            SyncOp::CachePut(c) => &c.hash,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
