// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local write-ahead cache.  Every write lands here first and is considered
//! durable once committed; remote replication happens asynchronously through
//! the sync queue written in the same transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::schema::{LOCAL_TABLES, SHARED_INDEXES, SHARED_TABLES};
use crate::types::{
    CommandCacheEntry, ConversationSummary, MachineInfo, NewTurn, Partition, SessionRow,
    SyncOp, TurnPatch, TurnRecord, TurnStatus, UserRow,
};
use crate::StoreError;

/// Result of merging one remote row into the local mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Remote row was newer; local columns were overwritten.
    Updated,
    /// Local row was newer or equal; remote row ignored.
    KeptLocal,
}

pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;
        for sql in SHARED_TABLES.iter().chain(SHARED_INDEXES).chain(LOCAL_TABLES) {
            conn.execute(sql, [])?;
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    // ─── Turns ────────────────────────────────────────────────────────────────

    /// Insert a turn with `status=pending` and `response=null` into the
    /// global and per-machine partitions, plus per-user when a user id is
    /// present.  Fails with [`StoreError::DuplicateRequest`] when the
    /// request id has been seen before.
    pub fn record_turn(&self, new: NewTurn) -> Result<String, StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM history_global WHERE request_id = ?1",
                params![new.request_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::DuplicateRequest(new.request_id));
        }

        let record = TurnRecord {
            id: new.id.clone(),
            command: new.command,
            response: None,
            user_id: new.user_id,
            machine_id: new.machine_id,
            session_id: new.session_id,
            timestamp: new.timestamp,
            status: TurnStatus::Pending,
            request_id: new.request_id,
            updated_at: None,
            completed_at: None,
            tokens_used: None,
            execution_time_ms: None,
            error_code: None,
            context: new.context,
        };

        insert_turn(&tx, &record)?;
        enqueue(&tx, &SyncOp::UpsertTurn(record.clone()))?;
        tx.commit()?;
        debug!(id = %record.id, request_id = %record.request_id, "turn recorded");
        Ok(record.id)
    }

    /// Apply a patch to the turn identified by `request_id` across all
    /// partitions it was written to.
    ///
    /// Immutable fields are unrepresentable in [`TurnPatch`]; this method
    /// additionally rejects any update to a turn already in a terminal
    /// state, and any status change that is not monotonic.
    pub fn update_turn(
        &self,
        request_id: &str,
        patch: TurnPatch,
    ) -> Result<TurnRecord, StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;

        let mut record = read_turn_tx(&tx, request_id)?
            .ok_or_else(|| StoreError::TurnNotFound(request_id.to_string()))?;

        if record.status.is_terminal() {
            return Err(StoreError::InvalidUpdate(format!(
                "turn {} is already {}",
                record.id,
                record.status.as_str()
            )));
        }
        if let Some(to) = patch.status {
            if !record.status.can_transition(to) {
                return Err(StoreError::InvalidUpdate(format!(
                    "{} -> {} is not a valid status transition",
                    record.status.as_str(),
                    to.as_str()
                )));
            }
            record.status = to;
        }
        if let Some(response) = patch.response {
            record.response = Some(response);
        }
        if patch.tokens_used.is_some() {
            record.tokens_used = patch.tokens_used;
        }
        if patch.execution_time_ms.is_some() {
            record.execution_time_ms = patch.execution_time_ms;
        }
        if patch.error_code.is_some() {
            record.error_code = patch.error_code;
        }
        let now = Self::now();
        record.updated_at = Some(now);
        record.completed_at = record.status.is_terminal().then_some(now);

        write_turn_columns(&tx, &record)?;
        enqueue(&tx, &SyncOp::UpsertTurn(record.clone()))?;
        tx.commit()?;
        Ok(record)
    }

    pub fn read_turn(&self, request_id: &str) -> Result<Option<TurnRecord>, StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        read_turn_tx(&tx, request_id)
    }

    /// Turns in reverse chronological order for the given partition.
    /// Ties on `timestamp` break by `request_id` so the order is total.
    pub fn read_recent_turns(
        &self,
        partition: &Partition,
        limit: usize,
        since: Option<i64>,
    ) -> Result<Vec<TurnRecord>, StoreError> {
        let conn = self.conn();
        let since = since.unwrap_or(0);
        let (sql, rows) = match partition {
            Partition::Global => {
                let mut stmt = conn.prepare(
                    "SELECT id, command, response, user_id, machine_id, session_id,
                            timestamp, status, request_id, updated_at, completed_at,
                            tokens_used, execution_time_ms, NULL, context
                     FROM history_global WHERE timestamp >= ?1
                     ORDER BY timestamp DESC, request_id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![since, limit as i64], turn_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                ("global", rows)
            }
            Partition::User(uid) => {
                let mut stmt = conn.prepare(
                    "SELECT id, command, response, user_id, machine_id, session_id,
                            timestamp, status, request_id, updated_at, completed_at,
                            tokens_used, execution_time_ms, NULL, context
                     FROM history_user WHERE user_id = ?1 AND timestamp >= ?2
                     ORDER BY timestamp DESC, request_id DESC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![uid, since, limit as i64], turn_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                ("user", rows)
            }
            Partition::Machine(mid) => {
                let mut stmt = conn.prepare(
                    "SELECT id, command, response, user_id, machine_id, session_id,
                            timestamp, status, request_id, updated_at, completed_at,
                            tokens_used, execution_time_ms, error_code, context
                     FROM history_machine WHERE machine_id = ?1 AND timestamp >= ?2
                     ORDER BY timestamp DESC, request_id DESC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![mid, since, limit as i64], turn_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                ("machine", rows)
            }
        };
        debug!(partition = sql, n = rows.len(), "read recent turns");
        Ok(rows)
    }

    /// Merge a row pulled from the remote.  Last-writer-wins on
    /// `updated_at` (falling back to `timestamp`).
    pub fn merge_remote_turn(&self, remote: &TurnRecord) -> Result<MergeOutcome, StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        let outcome = match read_turn_tx(&tx, &remote.request_id)? {
            None => {
                insert_turn(&tx, remote)?;
                MergeOutcome::Inserted
            }
            Some(local) if remote.lww_stamp() > local.lww_stamp() => {
                write_turn_columns(&tx, remote)?;
                MergeOutcome::Updated
            }
            Some(_) => MergeOutcome::KeptLocal,
        };
        tx.commit()?;
        Ok(outcome)
    }

    // ─── Summaries ────────────────────────────────────────────────────────────

    /// Atomic replace of the summary for (user, machine).
    pub fn upsert_summary(&self, summary: &ConversationSummary) -> Result<(), StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        tx.execute(
            "DELETE FROM conversation_summaries
             WHERE COALESCE(user_id, -1) = COALESCE(?1, -1) AND machine_id = ?2",
            params![summary.user_id, summary.machine_id],
        )?;
        tx.execute(
            "INSERT INTO conversation_summaries
                (user_id, machine_id, summary, summarized_up_to_message_id,
                 message_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                summary.user_id,
                summary.machine_id,
                summary.summary,
                summary.summarized_up_to_message_id,
                summary.message_count,
                summary.updated_at,
            ],
        )?;
        enqueue(&tx, &SyncOp::UpsertSummary(summary.clone()))?;
        tx.commit()?;
        Ok(())
    }

    pub fn read_summary(
        &self,
        user_id: Option<i64>,
        machine_id: &str,
    ) -> Result<Option<ConversationSummary>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT user_id, machine_id, summary, summarized_up_to_message_id,
                        message_count, updated_at
                 FROM conversation_summaries
                 WHERE COALESCE(user_id, -1) = COALESCE(?1, -1) AND machine_id = ?2
                 ORDER BY updated_at DESC LIMIT 1",
                params![user_id, machine_id],
                |r| {
                    Ok(ConversationSummary {
                        user_id: r.get(0)?,
                        machine_id: r.get(1)?,
                        summary: r.get(2)?,
                        summarized_up_to_message_id: r.get(3)?,
                        message_count: r.get(4)?,
                        updated_at: r.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ─── Command cache ────────────────────────────────────────────────────────

    /// TTL-checked read.  Expired entries are deleted lazily.
    pub fn cache_get(
        &self,
        hash: &str,
        max_age: Duration,
    ) -> Result<Option<CommandCacheEntry>, StoreError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                "SELECT hash, command, output, machine_id, last_executed,
                        execution_count, avg_execution_time_ms
                 FROM command_cache WHERE hash = ?1",
                params![hash],
                |r| {
                    Ok(CommandCacheEntry {
                        hash: r.get(0)?,
                        command: r.get(1)?,
                        output: r.get(2)?,
                        machine_id: r.get(3)?,
                        last_executed: r.get(4)?,
                        execution_count: r.get(5)?,
                        avg_execution_time_ms: r.get(6)?,
                    })
                },
            )
            .optional()?;
        match entry {
            Some(e) if Self::now() - e.last_executed < max_age.as_secs() as i64 => {
                Ok(Some(e))
            }
            Some(e) => {
                conn.execute("DELETE FROM command_cache WHERE hash = ?1", params![e.hash])?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Insert or refresh a cache entry, maintaining the execution count and
    /// rolling average duration.
    pub fn cache_put(
        &self,
        hash: &str,
        command: &str,
        output: &str,
        machine_id: Option<&str>,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        let now = Self::now();
        tx.execute(
            "INSERT INTO command_cache
                (hash, command, output, machine_id, last_executed,
                 execution_count, avg_execution_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT(hash) DO UPDATE SET
                output = excluded.output,
                last_executed = excluded.last_executed,
                execution_count = execution_count + 1,
                avg_execution_time_ms =
                    (avg_execution_time_ms * execution_count + ?6)
                    / (execution_count + 1)",
            params![hash, command, output, machine_id, now, duration_ms],
        )?;
        let entry = tx.query_row(
            "SELECT hash, command, output, machine_id, last_executed,
                    execution_count, avg_execution_time_ms
             FROM command_cache WHERE hash = ?1",
            params![hash],
            |r| {
                Ok(CommandCacheEntry {
                    hash: r.get(0)?,
                    command: r.get(1)?,
                    output: r.get(2)?,
                    machine_id: r.get(3)?,
                    last_executed: r.get(4)?,
                    execution_count: r.get(5)?,
                    avg_execution_time_ms: r.get(6)?,
                })
            },
        )?;
        enqueue(&tx, &SyncOp::CachePut(entry))?;
        tx.commit()?;
        Ok(())
    }

    // ─── Users / machines / sessions ──────────────────────────────────────────

    pub fn resolve_user(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, username, display_name, email, created_at, active
                 FROM users WHERE username = ?1 AND active = 1",
                params![username],
                |r| {
                    Ok(UserRow {
                        id: r.get(0)?,
                        username: r.get(1)?,
                        display_name: r.get(2)?,
                        email: r.get(3)?,
                        created_at: r.get(4)?,
                        active: r.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Mirror a user row fetched from the remote.
    pub fn upsert_user(&self, user: &UserRow) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO users
                (id, username, display_name, email, created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id,
                user.username,
                user.display_name,
                user.email,
                user.created_at,
                user.active,
            ],
        )?;
        Ok(())
    }

    /// Insert or refresh this machine's row and queue it for replication.
    pub fn register_machine(&self, machine: &MachineInfo) -> Result<(), StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        tx.execute(
            "INSERT INTO machines
                (machine_id, hostname, ip, os_info, first_seen, last_seen, total_commands)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(machine_id) DO UPDATE SET
                hostname = excluded.hostname,
                ip = excluded.ip,
                os_info = excluded.os_info,
                last_seen = excluded.last_seen",
            params![
                machine.machine_id,
                machine.hostname,
                machine.ip,
                machine.os_info,
                machine.first_seen,
                machine.last_seen,
                machine.total_commands,
            ],
        )?;
        enqueue(&tx, &SyncOp::UpsertMachine(machine.clone()))?;
        tx.commit()?;
        Ok(())
    }

    /// Bump `total_commands` and `last_seen` after a completed turn.
    pub fn increment_machine_commands(&self, machine_id: &str) -> Result<(), StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        tx.execute(
            "UPDATE machines SET total_commands = total_commands + 1, last_seen = ?2
             WHERE machine_id = ?1",
            params![machine_id, Self::now()],
        )?;
        let machine = tx
            .query_row(
                "SELECT machine_id, hostname, ip, os_info, first_seen, last_seen,
                        total_commands
                 FROM machines WHERE machine_id = ?1",
                params![machine_id],
                |r| {
                    Ok(MachineInfo {
                        machine_id: r.get(0)?,
                        hostname: r.get(1)?,
                        ip: r.get(2)?,
                        os_info: r.get(3)?,
                        first_seen: r.get(4)?,
                        last_seen: r.get(5)?,
                        total_commands: r.get(6)?,
                    })
                },
            )
            .optional()?;
        if let Some(m) = machine {
            enqueue(&tx, &SyncOp::UpsertMachine(m))?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn open_session(&self, session: &SessionRow) -> Result<(), StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO sessions
                (id, machine_id, user_id, started_at, ended_at, command_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.machine_id,
                session.user_id,
                session.started_at,
                session.ended_at,
                session.command_count,
            ],
        )?;
        enqueue(&tx, &SyncOp::UpsertSession(session.clone()))?;
        tx.commit()?;
        Ok(())
    }

    pub fn close_session(&self, session_id: &str, ended_at: i64) -> Result<(), StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        tx.execute(
            "UPDATE sessions SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
            params![session_id, ended_at],
        )?;
        if let Some(session) = read_session_tx(&tx, session_id)? {
            enqueue(&tx, &SyncOp::UpsertSession(session))?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn bump_session_commands(&self, session_id: &str) -> Result<(), StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        tx.execute(
            "UPDATE sessions SET command_count = command_count + 1 WHERE id = ?1",
            params![session_id],
        )?;
        if let Some(session) = read_session_tx(&tx, session_id)? {
            enqueue(&tx, &SyncOp::UpsertSession(session))?;
        }
        tx.commit()?;
        Ok(())
    }

    // ─── Sync queue ───────────────────────────────────────────────────────────

    /// Queue entries due for a push attempt, in insertion order.
    pub fn sync_due_batch(
        &self,
        limit: usize,
    ) -> Result<Vec<(i64, SyncOp, i64)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, payload, attempts FROM sync_queue
             WHERE next_attempt_at <= ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![Self::now(), limit as i64], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (seq, payload, attempts) in rows {
            out.push((seq, serde_json::from_str(&payload)?, attempts));
        }
        Ok(out)
    }

    pub fn sync_mark_done(&self, seq: i64) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM sync_queue WHERE seq = ?1", params![seq])?;
        Ok(())
    }

    /// Record a failed push attempt.  Applies exponential backoff (capped at
    /// five minutes) and moves the entry to the dead-letter list once it
    /// exceeds `max_retries`.  Returns true when the entry was dead-lettered.
    pub fn sync_mark_failed(
        &self,
        seq: i64,
        error: &str,
        max_retries: i64,
    ) -> Result<bool, StoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        let attempts: i64 = tx.query_row(
            "SELECT attempts FROM sync_queue WHERE seq = ?1",
            params![seq],
            |r| r.get(0),
        )?;
        let attempts = attempts + 1;
        let dead = attempts > max_retries;
        if dead {
            tx.execute(
                "INSERT INTO sync_dead_letter
                    (seq, record_id, op, payload, attempts, last_error, moved_at)
                 SELECT seq, record_id, op, payload, ?2, ?3, ?4
                 FROM sync_queue WHERE seq = ?1",
                params![seq, attempts, error, Self::now()],
            )?;
            tx.execute("DELETE FROM sync_queue WHERE seq = ?1", params![seq])?;
        } else {
            // 30s, 60s, 120s, 240s, then the 300s cap.
            let backoff = (30i64 << (attempts - 1).min(16)).min(300);
            tx.execute(
                "UPDATE sync_queue
                 SET attempts = ?2, last_error = ?3, next_attempt_at = ?4
                 WHERE seq = ?1",
                params![seq, attempts, error, Self::now() + backoff],
            )?;
        }
        tx.commit()?;
        Ok(dead)
    }

    pub fn sync_pending_count(&self) -> Result<i64, StoreError> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |r| r.get(0))?;
        Ok(n)
    }

    pub fn dead_letter_count(&self) -> Result<i64, StoreError> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM sync_dead_letter", [], |r| r.get(0))?;
        Ok(n)
    }

    pub fn pull_watermark(&self) -> Result<i64, StoreError> {
        let v = self
            .conn()
            .query_row(
                "SELECT value FROM sync_state WHERE key = 'last_pull_watermark'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v.unwrap_or(0))
    }

    pub fn set_pull_watermark(&self, value: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO sync_state (key, value)
             VALUES ('last_pull_watermark', ?1)",
            params![value],
        )?;
        Ok(())
    }
}

// ─── Row helpers ─────────────────────────────────────────────────────────────

fn turn_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TurnRecord> {
    let status_str: String = r.get(7)?;
    Ok(TurnRecord {
        id: r.get(0)?,
        command: r.get(1)?,
        response: r.get(2)?,
        user_id: r.get(3)?,
        machine_id: r.get(4)?,
        session_id: r.get(5)?,
        timestamp: r.get(6)?,
        status: TurnStatus::parse(&status_str).unwrap_or(TurnStatus::Error),
        request_id: r.get(8)?,
        updated_at: r.get(9)?,
        completed_at: r.get(10)?,
        tokens_used: r.get(11)?,
        execution_time_ms: r.get(12)?,
        error_code: r.get(13)?,
        context: r.get(14)?,
    })
}

fn read_turn_tx(
    tx: &rusqlite::Transaction<'_>,
    request_id: &str,
) -> Result<Option<TurnRecord>, StoreError> {
    // The machine partition carries error_code, so it is the canonical read
    // source; every turn is written there.
    let row = tx
        .query_row(
            "SELECT id, command, response, user_id, machine_id, session_id,
                    timestamp, status, request_id, updated_at, completed_at,
                    tokens_used, execution_time_ms, error_code, context
             FROM history_machine WHERE request_id = ?1",
            params![request_id],
            turn_from_row,
        )
        .optional()?;
    Ok(row)
}

fn read_session_tx(
    tx: &rusqlite::Transaction<'_>,
    session_id: &str,
) -> Result<Option<SessionRow>, StoreError> {
    let row = tx
        .query_row(
            "SELECT id, machine_id, user_id, started_at, ended_at, command_count
             FROM sessions WHERE id = ?1",
            params![session_id],
            |r| {
                Ok(SessionRow {
                    id: r.get(0)?,
                    machine_id: r.get(1)?,
                    user_id: r.get(2)?,
                    started_at: r.get(3)?,
                    ended_at: r.get(4)?,
                    command_count: r.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn insert_turn(tx: &rusqlite::Transaction<'_>, t: &TurnRecord) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO history_global
            (id, command, response, user_id, machine_id, session_id, timestamp,
             status, request_id, updated_at, completed_at, tokens_used,
             execution_time_ms, context)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            t.id, t.command, t.response, t.user_id, t.machine_id, t.session_id,
            t.timestamp, t.status.as_str(), t.request_id, t.updated_at,
            t.completed_at, t.tokens_used, t.execution_time_ms, t.context,
        ],
    )?;
    tx.execute(
        "INSERT INTO history_machine
            (id, command, response, user_id, machine_id, session_id, timestamp,
             status, request_id, updated_at, completed_at, tokens_used,
             execution_time_ms, error_code, context)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            t.id, t.command, t.response, t.user_id, t.machine_id, t.session_id,
            t.timestamp, t.status.as_str(), t.request_id, t.updated_at,
            t.completed_at, t.tokens_used, t.execution_time_ms, t.error_code,
            t.context,
        ],
    )?;
    if let Some(uid) = t.user_id {
        let result = tx.execute(
            "INSERT INTO history_user
                (id, command, response, user_id, machine_id, session_id, timestamp,
                 status, request_id, updated_at, completed_at, tokens_used,
                 execution_time_ms, context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                t.id, t.command, t.response, uid, t.machine_id, t.session_id,
                t.timestamp, t.status.as_str(), t.request_id, t.updated_at,
                t.completed_at, t.tokens_used, t.execution_time_ms, t.context,
            ],
        );
        if let Err(rusqlite::Error::SqliteFailure(e, _)) = &result {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return Err(StoreError::DuplicateRequest(t.request_id.clone()));
            }
        }
        result?;
    }
    Ok(())
}

fn write_turn_columns(tx: &rusqlite::Transaction<'_>, t: &TurnRecord) -> Result<(), StoreError> {
    for table in ["history_global", "history_user"] {
        tx.execute(
            &format!(
                "UPDATE {table} SET response = ?2, status = ?3, updated_at = ?4,
                        completed_at = ?5, tokens_used = ?6, execution_time_ms = ?7
                 WHERE request_id = ?1"
            ),
            params![
                t.request_id, t.response, t.status.as_str(), t.updated_at,
                t.completed_at, t.tokens_used, t.execution_time_ms,
            ],
        )?;
    }
    tx.execute(
        "UPDATE history_machine SET response = ?2, status = ?3, updated_at = ?4,
                completed_at = ?5, tokens_used = ?6, execution_time_ms = ?7,
                error_code = ?8
         WHERE request_id = ?1",
        params![
            t.request_id, t.response, t.status.as_str(), t.updated_at,
            t.completed_at, t.tokens_used, t.execution_time_ms, t.error_code,
        ],
    )?;
    Ok(())
}

fn enqueue(tx: &rusqlite::Transaction<'_>, op: &SyncOp) -> Result<(), StoreError> {
    let payload = serde_json::to_string(op)?;
    let op_name = match op {
        SyncOp::UpsertTurn(_) => "upsert_turn",
        SyncOp::UpsertSummary(_) => "upsert_summary",
        SyncOp::UpsertMachine(_) => "upsert_machine",
        SyncOp::UpsertSession(_) => "upsert_session",
        SyncOp::CachePut(_) => "cache_put",
    };
    tx.execute(
        "INSERT INTO sync_queue (record_id, op, payload) VALUES (?1, ?2, ?3)",
        params![op.record_id(), op_name, payload],
    )?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LocalStore {
        LocalStore::open_in_memory().unwrap()
    }

    fn new_turn(request_id: &str, user_id: Option<i64>) -> NewTurn {
        NewTurn {
            id: format!("turn-{request_id}"),
            command: "how much disk space is free?".into(),
            user_id,
            machine_id: "machine-1".into(),
            session_id: Some("sess-1".into()),
            timestamp: 1_700_000_000,
            request_id: request_id.into(),
            context: None,
        }
    }

    #[test]
    fn record_then_read_round_trips() {
        let s = store();
        s.record_turn(new_turn("r1", Some(7))).unwrap();
        let t = s.read_turn("r1").unwrap().unwrap();
        assert_eq!(t.status, TurnStatus::Pending);
        assert_eq!(t.response, None);
        assert_eq!(t.user_id, Some(7));
    }

    #[test]
    fn duplicate_request_id_is_rejected() {
        let s = store();
        s.record_turn(new_turn("r1", None)).unwrap();
        let err = s.record_turn(new_turn("r1", None)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRequest(id) if id == "r1"));
    }

    #[test]
    fn turn_written_to_all_three_partitions_when_user_present() {
        let s = store();
        s.record_turn(new_turn("r1", Some(7))).unwrap();
        assert_eq!(s.read_recent_turns(&Partition::Global, 10, None).unwrap().len(), 1);
        assert_eq!(s.read_recent_turns(&Partition::User(7), 10, None).unwrap().len(), 1);
        assert_eq!(
            s.read_recent_turns(&Partition::Machine("machine-1".into()), 10, None)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn anonymous_turn_skips_user_partition() {
        let s = store();
        s.record_turn(new_turn("r1", None)).unwrap();
        assert_eq!(s.read_recent_turns(&Partition::User(7), 10, None).unwrap().len(), 0);
        assert_eq!(s.read_recent_turns(&Partition::Global, 10, None).unwrap().len(), 1);
    }

    #[test]
    fn update_completes_turn_and_sets_completed_at() {
        let s = store();
        s.record_turn(new_turn("r1", Some(7))).unwrap();
        let patch = TurnPatch {
            status: Some(TurnStatus::Completed),
            response: Some("42G free on /".into()),
            tokens_used: Some(120),
            execution_time_ms: Some(900),
            ..Default::default()
        };
        let t = s.update_turn("r1", patch).unwrap();
        assert_eq!(t.status, TurnStatus::Completed);
        assert!(t.completed_at.is_some());
        // The user partition sees the same columns.
        let turns = s.read_recent_turns(&Partition::User(7), 10, None).unwrap();
        assert_eq!(turns[0].response.as_deref(), Some("42G free on /"));
        assert_eq!(turns[0].tokens_used, Some(120));
    }

    #[test]
    fn update_of_terminal_turn_is_rejected() {
        let s = store();
        s.record_turn(new_turn("r1", None)).unwrap();
        s.update_turn("r1", TurnPatch { status: Some(TurnStatus::Cancelled), ..Default::default() })
            .unwrap();
        let err = s
            .update_turn("r1", TurnPatch { status: Some(TurnStatus::Completed), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate(_)));
    }

    #[test]
    fn cancelled_from_pending_is_allowed() {
        let s = store();
        s.record_turn(new_turn("r1", None)).unwrap();
        let t = s
            .update_turn("r1", TurnPatch { status: Some(TurnStatus::Cancelled), ..Default::default() })
            .unwrap();
        assert_eq!(t.status, TurnStatus::Cancelled);
        assert_eq!(t.response, None);
    }

    #[test]
    fn recent_turns_are_reverse_chronological() {
        let s = store();
        for (i, ts) in [(1, 100), (2, 300), (3, 200)] {
            let mut t = new_turn(&format!("r{i}"), None);
            t.id = format!("t{i}");
            t.timestamp = ts;
            s.record_turn(t).unwrap();
        }
        let turns = s.read_recent_turns(&Partition::Global, 10, None).unwrap();
        let stamps: Vec<i64> = turns.iter().map(|t| t.timestamp).collect();
        assert_eq!(stamps, vec![300, 200, 100]);
    }

    #[test]
    fn since_filter_excludes_older_turns() {
        let s = store();
        let mut a = new_turn("r1", None);
        a.timestamp = 100;
        let mut b = new_turn("r2", None);
        b.id = "t2".into();
        b.timestamp = 500;
        s.record_turn(a).unwrap();
        s.record_turn(b).unwrap();
        let turns = s.read_recent_turns(&Partition::Global, 10, Some(200)).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].request_id, "r2");
    }

    #[test]
    fn summary_upsert_replaces_previous_row() {
        let s = store();
        let mut summary = ConversationSummary {
            user_id: Some(7),
            machine_id: "m1".into(),
            summary: "## Session\n- first".into(),
            summarized_up_to_message_id: "msg-1".into(),
            message_count: 10,
            updated_at: 100,
        };
        s.upsert_summary(&summary).unwrap();
        summary.summary = "## Session\n- second".into();
        summary.updated_at = 200;
        s.upsert_summary(&summary).unwrap();
        let read = s.read_summary(Some(7), "m1").unwrap().unwrap();
        assert!(read.summary.contains("second"));
        assert_eq!(read.message_count, 10);
    }

    #[test]
    fn summaries_are_scoped_by_user_and_machine() {
        let s = store();
        let anon = ConversationSummary {
            user_id: None,
            machine_id: "m1".into(),
            summary: "anon".into(),
            summarized_up_to_message_id: "x".into(),
            message_count: 10,
            updated_at: 1,
        };
        s.upsert_summary(&anon).unwrap();
        assert!(s.read_summary(Some(7), "m1").unwrap().is_none());
        assert!(s.read_summary(None, "m2").unwrap().is_none());
        assert!(s.read_summary(None, "m1").unwrap().is_some());
    }

    #[test]
    fn cache_respects_ttl() {
        let s = store();
        s.cache_put("h1", "uname -a", "Linux", None, 10).unwrap();
        assert!(s.cache_get("h1", Duration::from_secs(3600)).unwrap().is_some());
        assert!(s.cache_get("h1", Duration::from_secs(0)).unwrap().is_none());
        // Expired entry was evicted.
        assert!(s.cache_get("h1", Duration::from_secs(3600)).unwrap().is_none());
    }

    #[test]
    fn cache_put_twice_increments_execution_count() {
        let s = store();
        s.cache_put("h1", "df -h", "out1", None, 100).unwrap();
        s.cache_put("h1", "df -h", "out2", None, 300).unwrap();
        let e = s.cache_get("h1", Duration::from_secs(3600)).unwrap().unwrap();
        assert_eq!(e.execution_count, 2);
        assert_eq!(e.output, "out2");
        assert_eq!(e.avg_execution_time_ms, 200);
    }

    #[test]
    fn sync_queue_preserves_insertion_order() {
        let s = store();
        s.record_turn(new_turn("r1", None)).unwrap();
        s.record_turn({
            let mut t = new_turn("r2", None);
            t.id = "t2".into();
            t
        })
        .unwrap();
        let batch = s.sync_due_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].0 < batch[1].0);
        assert!(matches!(&batch[0].1, SyncOp::UpsertTurn(t) if t.request_id == "r1"));
    }

    #[test]
    fn failed_sync_entry_backs_off_then_dead_letters() {
        let s = store();
        s.record_turn(new_turn("r1", None)).unwrap();
        let (seq, _, _) = s.sync_due_batch(10).unwrap().remove(0);

        // First failure: entry is kept but scheduled for later.
        let dead = s.sync_mark_failed(seq, "connection refused", 5).unwrap();
        assert!(!dead);
        assert!(s.sync_due_batch(10).unwrap().is_empty(), "entry should be backing off");
        assert_eq!(s.sync_pending_count().unwrap(), 1);

        // Exhaust the retry budget.
        for _ in 0..5 {
            let _ = s.sync_mark_failed(seq, "connection refused", 5).unwrap();
        }
        assert_eq!(s.sync_pending_count().unwrap(), 0);
        assert_eq!(s.dead_letter_count().unwrap(), 1);
    }

    #[test]
    fn merge_remote_prefers_newer_writer() {
        let s = store();
        s.record_turn(new_turn("r1", None)).unwrap();
        let local = s.read_turn("r1").unwrap().unwrap();

        // Older remote row loses.
        let mut stale = local.clone();
        stale.response = Some("stale".into());
        stale.updated_at = Some(local.lww_stamp() - 10);
        assert_eq!(s.merge_remote_turn(&stale).unwrap(), MergeOutcome::KeptLocal);

        // Newer remote row wins.
        let mut fresh = local.clone();
        fresh.response = Some("fresh".into());
        fresh.status = TurnStatus::Completed;
        fresh.updated_at = Some(local.lww_stamp() + 10);
        assert_eq!(s.merge_remote_turn(&fresh).unwrap(), MergeOutcome::Updated);
        let read = s.read_turn("r1").unwrap().unwrap();
        assert_eq!(read.response.as_deref(), Some("fresh"));
    }

    #[test]
    fn merge_remote_inserts_unknown_turn() {
        let s = store();
        let remote = TurnRecord {
            id: "t9".into(),
            command: "uptime".into(),
            response: Some("up 3 days".into()),
            user_id: None,
            machine_id: "other-machine".into(),
            session_id: None,
            timestamp: 123,
            status: TurnStatus::Completed,
            request_id: "r9".into(),
            updated_at: Some(124),
            completed_at: Some(124),
            tokens_used: None,
            execution_time_ms: None,
            error_code: None,
            context: None,
        };
        assert_eq!(s.merge_remote_turn(&remote).unwrap(), MergeOutcome::Inserted);
        assert!(s.read_turn("r9").unwrap().is_some());
    }

    #[test]
    fn watermark_round_trips() {
        let s = store();
        assert_eq!(s.pull_watermark().unwrap(), 0);
        s.set_pull_watermark(1234).unwrap();
        assert_eq!(s.pull_watermark().unwrap(), 1234);
    }

    #[test]
    fn machine_registration_updates_last_seen() {
        let s = store();
        let mut m = MachineInfo {
            machine_id: "m1".into(),
            hostname: "web01".into(),
            ip: None,
            os_info: "Ubuntu 24.04".into(),
            first_seen: 100,
            last_seen: 100,
            total_commands: 0,
        };
        s.register_machine(&m).unwrap();
        m.last_seen = 200;
        s.register_machine(&m).unwrap();
        s.increment_machine_commands("m1").unwrap();
        // Row exists and counting works; verified through the queue payload.
        let ops = s.sync_due_batch(50).unwrap();
        let counts: Vec<i64> = ops
            .iter()
            .filter_map(|(_, op, _)| match op {
                SyncOp::UpsertMachine(m) => Some(m.total_commands),
                _ => None,
            })
            .collect();
        assert_eq!(counts.last(), Some(&1));
    }

    #[test]
    fn session_lifecycle_round_trips() {
        let s = store();
        let session = SessionRow {
            id: "sess-1".into(),
            machine_id: "m1".into(),
            user_id: None,
            started_at: 100,
            ended_at: None,
            command_count: 0,
        };
        s.open_session(&session).unwrap();
        s.bump_session_commands("sess-1").unwrap();
        s.close_session("sess-1", 200).unwrap();
        let ops = s.sync_due_batch(50).unwrap();
        let last_session = ops
            .iter()
            .filter_map(|(_, op, _)| match op {
                SyncOp::UpsertSession(s) => Some(s.clone()),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_session.ended_at, Some(200));
        assert_eq!(last_session.command_count, 1);
    }
}
