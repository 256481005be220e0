// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SQL schema shared by the local cache and the remote replicated database.
//!
//! All timestamps are INTEGER Unix seconds.  `history_user(request_id)` is
//! UNIQUE; the global and per-machine partitions intentionally are not (the
//! per-machine partition additionally carries `error_code`).

/// Tables that exist both locally and remotely.
pub const SHARED_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL DEFAULT '',
        email TEXT,
        created_at INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS machines (
        machine_id TEXT PRIMARY KEY,
        hostname TEXT NOT NULL,
        ip TEXT,
        os_info TEXT NOT NULL DEFAULT '',
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        total_commands INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        machine_id TEXT NOT NULL,
        user_id INTEGER,
        started_at INTEGER NOT NULL,
        ended_at INTEGER,
        command_count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS history_global (
        id TEXT PRIMARY KEY,
        command TEXT NOT NULL,
        response TEXT,
        user_id INTEGER,
        machine_id TEXT NOT NULL,
        session_id TEXT,
        timestamp INTEGER NOT NULL,
        status TEXT NOT NULL,
        request_id TEXT NOT NULL,
        updated_at INTEGER,
        completed_at INTEGER,
        tokens_used INTEGER,
        execution_time_ms INTEGER,
        context TEXT
    )",
    "CREATE TABLE IF NOT EXISTS history_user (
        id TEXT PRIMARY KEY,
        command TEXT NOT NULL,
        response TEXT,
        user_id INTEGER NOT NULL,
        machine_id TEXT NOT NULL,
        session_id TEXT,
        timestamp INTEGER NOT NULL,
        status TEXT NOT NULL,
        request_id TEXT NOT NULL UNIQUE,
        updated_at INTEGER,
        completed_at INTEGER,
        tokens_used INTEGER,
        execution_time_ms INTEGER,
        context TEXT
    )",
    "CREATE TABLE IF NOT EXISTS history_machine (
        id TEXT PRIMARY KEY,
        command TEXT NOT NULL,
        response TEXT,
        user_id INTEGER,
        machine_id TEXT NOT NULL,
        session_id TEXT,
        timestamp INTEGER NOT NULL,
        status TEXT NOT NULL,
        request_id TEXT NOT NULL,
        updated_at INTEGER,
        completed_at INTEGER,
        tokens_used INTEGER,
        execution_time_ms INTEGER,
        error_code TEXT,
        context TEXT
    )",
    "CREATE TABLE IF NOT EXISTS command_cache (
        hash TEXT PRIMARY KEY,
        command TEXT NOT NULL,
        output TEXT NOT NULL,
        machine_id TEXT,
        last_executed INTEGER NOT NULL,
        execution_count INTEGER NOT NULL DEFAULT 1,
        avg_execution_time_ms INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS conversation_summaries (
        user_id INTEGER,
        machine_id TEXT NOT NULL,
        summary TEXT NOT NULL,
        summarized_up_to_message_id TEXT NOT NULL,
        message_count INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
];

pub const SHARED_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_hist_global_ts ON history_global(timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_hist_global_req ON history_global(request_id)",
    "CREATE INDEX IF NOT EXISTS idx_hist_user_ts ON history_user(user_id, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_hist_machine_ts ON history_machine(machine_id, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_hist_machine_req ON history_machine(request_id)",
    // At most one summary per (user, machine); NULL user ids collapse to -1
    // so the uniqueness constraint applies to anonymous sessions too.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_summary_owner
        ON conversation_summaries(COALESCE(user_id, -1), machine_id)",
];

/// Local-only bookkeeping: the outbound replication queue, its dead-letter
/// list, and the pull watermark.
pub const LOCAL_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        record_id TEXT NOT NULL,
        op TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        next_attempt_at INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS sync_dead_letter (
        seq INTEGER PRIMARY KEY,
        record_id TEXT NOT NULL,
        op TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        last_error TEXT,
        moved_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sync_state (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    )",
];
