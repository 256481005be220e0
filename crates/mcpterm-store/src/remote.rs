// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Remote replicated database, spoken over the Turso-compatible HTTP
//! pipeline API (`POST /v2/pipeline`).  All failures surface as
//! [`StoreError::Remote`] and are handled by the sync worker — never shown
//! to the user.

use serde_json::{json, Value};
use tracing::debug;

use crate::schema::{SHARED_INDEXES, SHARED_TABLES};
use crate::types::{SyncOp, TurnRecord, TurnStatus, UserRow};
use crate::StoreError;

/// A positional SQL argument in the wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue {
    Null,
    Integer(i64),
    Text(String),
}

impl RemoteValue {
    fn to_wire(&self) -> Value {
        match self {
            // Integers travel as strings in the pipeline protocol.
            RemoteValue::Null => json!({ "type": "null" }),
            RemoteValue::Integer(i) => json!({ "type": "integer", "value": i.to_string() }),
            RemoteValue::Text(t) => json!({ "type": "text", "value": t }),
        }
    }

    fn from_wire(v: &Value) -> RemoteValue {
        match v["type"].as_str().unwrap_or("null") {
            "integer" => {
                let parsed = v["value"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| v["value"].as_i64());
                parsed.map(RemoteValue::Integer).unwrap_or(RemoteValue::Null)
            }
            "text" => RemoteValue::Text(v["value"].as_str().unwrap_or("").to_string()),
            _ => RemoteValue::Null,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RemoteValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RemoteValue::Text(t) => Some(t),
            _ => None,
        }
    }

    fn opt_i64(v: Option<&RemoteValue>) -> Option<i64> {
        v.and_then(RemoteValue::as_i64)
    }

    fn opt_text(v: Option<&RemoteValue>) -> Option<String> {
        v.and_then(|x| x.as_text().map(str::to_string))
    }
}

impl From<Option<i64>> for RemoteValue {
    fn from(v: Option<i64>) -> Self {
        v.map(RemoteValue::Integer).unwrap_or(RemoteValue::Null)
    }
}

impl From<Option<String>> for RemoteValue {
    fn from(v: Option<String>) -> Self {
        v.map(RemoteValue::Text).unwrap_or(RemoteValue::Null)
    }
}

impl From<&str> for RemoteValue {
    fn from(v: &str) -> Self {
        RemoteValue::Text(v.to_string())
    }
}

impl From<String> for RemoteValue {
    fn from(v: String) -> Self {
        RemoteValue::Text(v)
    }
}

impl From<i64> for RemoteValue {
    fn from(v: i64) -> Self {
        RemoteValue::Integer(v)
    }
}

pub struct RemoteStore {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl RemoteStore {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        let mut url = url.into();
        // Turso database URLs are given as libsql://host; the HTTP pipeline
        // lives on the same host over HTTPS.
        if let Some(host) = url.strip_prefix("libsql://") {
            url = format!("https://{host}");
        }
        Self {
            url: url.trim_end_matches('/').to_string(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn pipeline(&self, stmts: Vec<Value>) -> Result<Vec<Value>, StoreError> {
        let mut requests: Vec<Value> = stmts
            .into_iter()
            .map(|stmt| json!({ "type": "execute", "stmt": stmt }))
            .collect();
        requests.push(json!({ "type": "close" }));

        let resp = self
            .client
            .post(format!("{}/v2/pipeline", self.url))
            .bearer_auth(&self.token)
            .json(&json!({ "requests": requests }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Remote(format!("pipeline HTTP {status}: {body}")));
        }

        let body: Value = resp.json().await?;
        let results = body["results"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for r in &results {
            if r["type"].as_str() == Some("error") {
                let msg = r["error"]["message"].as_str().unwrap_or("unknown");
                return Err(StoreError::Remote(format!("statement failed: {msg}")));
            }
        }
        Ok(results)
    }

    fn stmt(sql: &str, args: &[RemoteValue]) -> Value {
        json!({
            "sql": sql,
            "args": args.iter().map(RemoteValue::to_wire).collect::<Vec<_>>(),
        })
    }

    pub async fn execute(&self, sql: &str, args: &[RemoteValue]) -> Result<(), StoreError> {
        self.pipeline(vec![Self::stmt(sql, args)]).await?;
        Ok(())
    }

    /// Run a single SELECT and return its rows as positional values.
    pub async fn query(
        &self,
        sql: &str,
        args: &[RemoteValue],
    ) -> Result<Vec<Vec<RemoteValue>>, StoreError> {
        let results = self.pipeline(vec![Self::stmt(sql, args)]).await?;
        let rows = results
            .first()
            .and_then(|r| r["response"]["result"]["rows"].as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|cells| cells.iter().map(RemoteValue::from_wire).collect())
                    .unwrap_or_default()
            })
            .collect())
    }

    /// Create the shared tables when they do not exist yet.  Harmless on an
    /// already-provisioned database.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let stmts: Vec<Value> = SHARED_TABLES
            .iter()
            .chain(SHARED_INDEXES)
            .map(|sql| Self::stmt(sql, &[]))
            .collect();
        self.pipeline(stmts).await?;
        Ok(())
    }

    /// Apply one replication op from the outbound queue.
    pub async fn apply(&self, op: &SyncOp) -> Result<(), StoreError> {
        match op {
            SyncOp::UpsertTurn(t) => self.upsert_turn(t).await,
            SyncOp::UpsertSummary(s) => {
                self.execute(
                    "DELETE FROM conversation_summaries
                     WHERE COALESCE(user_id, -1) = COALESCE(?, -1) AND machine_id = ?",
                    &[s.user_id.into(), s.machine_id.as_str().into()],
                )
                .await?;
                self.execute(
                    "INSERT INTO conversation_summaries
                        (user_id, machine_id, summary, summarized_up_to_message_id,
                         message_count, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    &[
                        s.user_id.into(),
                        s.machine_id.as_str().into(),
                        s.summary.as_str().into(),
                        s.summarized_up_to_message_id.as_str().into(),
                        s.message_count.into(),
                        s.updated_at.into(),
                    ],
                )
                .await
            }
            SyncOp::UpsertMachine(m) => {
                self.execute(
                    "INSERT INTO machines
                        (machine_id, hostname, ip, os_info, first_seen, last_seen,
                         total_commands)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(machine_id) DO UPDATE SET
                        hostname = excluded.hostname,
                        ip = excluded.ip,
                        os_info = excluded.os_info,
                        last_seen = excluded.last_seen,
                        total_commands = excluded.total_commands",
                    &[
                        m.machine_id.as_str().into(),
                        m.hostname.as_str().into(),
                        m.ip.clone().into(),
                        m.os_info.as_str().into(),
                        m.first_seen.into(),
                        m.last_seen.into(),
                        m.total_commands.into(),
                    ],
                )
                .await
            }
            SyncOp::UpsertSession(s) => {
                self.execute(
                    "INSERT OR REPLACE INTO sessions
                        (id, machine_id, user_id, started_at, ended_at, command_count)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    &[
                        s.id.as_str().into(),
                        s.machine_id.as_str().into(),
                        s.user_id.into(),
                        s.started_at.into(),
                        s.ended_at.into(),
                        s.command_count.into(),
                    ],
                )
                .await
            }
            SyncOp::CachePut(c) => {
                self.execute(
                    "INSERT OR REPLACE INTO command_cache
                        (hash, command, output, machine_id, last_executed,
                         execution_count, avg_execution_time_ms)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    &[
                        c.hash.as_str().into(),
                        c.command.as_str().into(),
                        c.output.as_str().into(),
                        c.machine_id.clone().into(),
                        c.last_executed.into(),
                        c.execution_count.into(),
                        c.avg_execution_time_ms.into(),
                    ],
                )
                .await
            }
        }
    }

    async fn upsert_turn(&self, t: &TurnRecord) -> Result<(), StoreError> {
        debug!(request_id = %t.request_id, status = t.status.as_str(), "push turn");
        let common = |table: &str, with_error_code: bool| {
            let (extra_col, extra_q) = if with_error_code {
                (", error_code", ", ?")
            } else {
                ("", "")
            };
            format!(
                "INSERT OR REPLACE INTO {table}
                    (id, command, response, user_id, machine_id, session_id,
                     timestamp, status, request_id, updated_at, completed_at,
                     tokens_used, execution_time_ms, context{extra_col})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?{extra_q})"
            )
        };
        let mut base: Vec<RemoteValue> = vec![
            t.id.as_str().into(),
            t.command.as_str().into(),
            t.response.clone().into(),
            t.user_id.into(),
            t.machine_id.as_str().into(),
            t.session_id.clone().into(),
            t.timestamp.into(),
            t.status.as_str().into(),
            t.request_id.as_str().into(),
            t.updated_at.into(),
            t.completed_at.into(),
            t.tokens_used.into(),
            t.execution_time_ms.into(),
            t.context.clone().into(),
        ];

        let mut stmts = vec![Self::stmt(&common("history_global", false), &base)];
        if t.user_id.is_some() {
            stmts.push(Self::stmt(&common("history_user", false), &base));
        }
        base.push(t.error_code.clone().into());
        stmts.push(Self::stmt(&common("history_machine", true), &base));

        self.pipeline(stmts).await?;
        Ok(())
    }

    /// Resolve a username against the remote users table.
    pub async fn fetch_user(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        let rows = self
            .query(
                "SELECT id, username, display_name, email, created_at, active
                 FROM users WHERE username = ? AND active = 1",
                &[username.into()],
            )
            .await?;
        Ok(rows.first().map(|r| UserRow {
            id: RemoteValue::opt_i64(r.first()).unwrap_or(0),
            username: RemoteValue::opt_text(r.get(1)).unwrap_or_default(),
            display_name: RemoteValue::opt_text(r.get(2)).unwrap_or_default(),
            email: RemoteValue::opt_text(r.get(3)),
            created_at: RemoteValue::opt_i64(r.get(4)).unwrap_or(0),
            active: RemoteValue::opt_i64(r.get(5)).unwrap_or(0) != 0,
        }))
    }

    /// Rows updated since `watermark` in the partitions this terminal
    /// follows: its machine partition, plus the user partition when a user
    /// is configured.
    pub async fn pull_turns_since(
        &self,
        watermark: i64,
        user_id: Option<i64>,
        machine_id: &str,
    ) -> Result<Vec<TurnRecord>, StoreError> {
        let mut turns = self
            .query(
                "SELECT id, command, response, user_id, machine_id, session_id,
                        timestamp, status, request_id, updated_at, completed_at,
                        tokens_used, execution_time_ms, error_code, context
                 FROM history_machine
                 WHERE machine_id = ? AND COALESCE(updated_at, timestamp) > ?
                 ORDER BY COALESCE(updated_at, timestamp) ASC",
                &[machine_id.into(), watermark.into()],
            )
            .await?
            .iter()
            .map(turn_from_remote_row)
            .collect::<Vec<_>>();

        if let Some(uid) = user_id {
            let user_rows = self
                .query(
                    "SELECT id, command, response, user_id, machine_id, session_id,
                            timestamp, status, request_id, updated_at, completed_at,
                            tokens_used, execution_time_ms, NULL, context
                     FROM history_user
                     WHERE user_id = ? AND COALESCE(updated_at, timestamp) > ?
                     ORDER BY COALESCE(updated_at, timestamp) ASC",
                    &[uid.into(), watermark.into()],
                )
                .await?;
            for row in &user_rows {
                let t = turn_from_remote_row(row);
                if !turns.iter().any(|x| x.request_id == t.request_id) {
                    turns.push(t);
                }
            }
        }
        Ok(turns)
    }
}

fn turn_from_remote_row(r: &Vec<RemoteValue>) -> TurnRecord {
    TurnRecord {
        id: RemoteValue::opt_text(r.first()).unwrap_or_default(),
        command: RemoteValue::opt_text(r.get(1)).unwrap_or_default(),
        response: RemoteValue::opt_text(r.get(2)),
        user_id: RemoteValue::opt_i64(r.get(3)),
        machine_id: RemoteValue::opt_text(r.get(4)).unwrap_or_default(),
        session_id: RemoteValue::opt_text(r.get(5)),
        timestamp: RemoteValue::opt_i64(r.get(6)).unwrap_or(0),
        status: RemoteValue::opt_text(r.get(7))
            .and_then(|s| TurnStatus::parse(&s))
            .unwrap_or(TurnStatus::Error),
        request_id: RemoteValue::opt_text(r.get(8)).unwrap_or_default(),
        updated_at: RemoteValue::opt_i64(r.get(9)),
        completed_at: RemoteValue::opt_i64(r.get(10)),
        tokens_used: RemoteValue::opt_i64(r.get(11)),
        execution_time_ms: RemoteValue::opt_i64(r.get(12)),
        error_code: RemoteValue::opt_text(r.get(13)),
        context: RemoteValue::opt_text(r.get(14)),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libsql_url_is_rewritten_to_https() {
        let r = RemoteStore::new("libsql://db.example.turso.io", "tok");
        assert_eq!(r.url, "https://db.example.turso.io");
    }

    #[test]
    fn plain_https_url_is_kept() {
        let r = RemoteStore::new("https://db.example.turso.io/", "tok");
        assert_eq!(r.url, "https://db.example.turso.io");
    }

    #[test]
    fn integer_args_travel_as_strings() {
        let v = RemoteValue::Integer(42).to_wire();
        assert_eq!(v["type"], "integer");
        assert_eq!(v["value"], "42");
    }

    #[test]
    fn wire_values_round_trip() {
        for v in [
            RemoteValue::Null,
            RemoteValue::Integer(-5),
            RemoteValue::Text("abc".into()),
        ] {
            assert_eq!(RemoteValue::from_wire(&v.to_wire()), v);
        }
    }

    #[test]
    fn remote_row_maps_to_turn_record() {
        let row: Vec<RemoteValue> = vec![
            "t1".into(),
            "df -h".into(),
            RemoteValue::Null,
            RemoteValue::Null,
            "m1".into(),
            RemoteValue::Null,
            RemoteValue::Integer(100),
            "pending".into(),
            "r1".into(),
            RemoteValue::Null,
            RemoteValue::Null,
            RemoteValue::Null,
            RemoteValue::Null,
            RemoteValue::Null,
            RemoteValue::Null,
        ];
        let t = turn_from_remote_row(&row);
        assert_eq!(t.id, "t1");
        assert_eq!(t.status, TurnStatus::Pending);
        assert_eq!(t.lww_stamp(), 100);
    }
}
