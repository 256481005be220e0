// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cooperative background task reconciling the local cache with the remote
//! replicated database.  Push first (outbound queue, insertion order), then
//! pull (rows updated since the last watermark, merged last-writer-wins).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::local::LocalStore;
use crate::remote::RemoteStore;
use crate::types::{SyncOp, TurnRecord};
use crate::StoreError;

/// Push retry budget before an entry moves to the dead-letter list.
const MAX_RETRIES: i64 = 5;
const BATCH_SIZE: usize = 50;

/// The narrow remote surface the worker needs.  [`RemoteStore`] is the
/// production implementation; tests substitute an in-memory fake.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn apply(&self, op: &SyncOp) -> Result<(), StoreError>;
    async fn pull_turns_since(
        &self,
        watermark: i64,
        user_id: Option<i64>,
        machine_id: &str,
    ) -> Result<Vec<TurnRecord>, StoreError>;
}

#[async_trait]
impl RemoteApi for RemoteStore {
    async fn apply(&self, op: &SyncOp) -> Result<(), StoreError> {
        RemoteStore::apply(self, op).await
    }

    async fn pull_turns_since(
        &self,
        watermark: i64,
        user_id: Option<i64>,
        machine_id: &str,
    ) -> Result<Vec<TurnRecord>, StoreError> {
        RemoteStore::pull_turns_since(self, watermark, user_id, machine_id).await
    }
}

/// Counters surfaced by `/status`.
#[derive(Debug, Clone, Default)]
pub struct SyncHealth {
    pub pushed: u64,
    pub pulled: u64,
    pub dead_lettered: u64,
    pub pending: u64,
    pub last_error: Option<String>,
}

/// Cheap clone handed to the UI: trigger a sync out of band, read health.
#[derive(Clone)]
pub struct SyncHandle {
    notify: Arc<Notify>,
    health: Arc<Mutex<SyncHealth>>,
}

impl SyncHandle {
    pub fn force_sync(&self) {
        self.notify.notify_one();
    }

    pub fn health(&self) -> SyncHealth {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct SyncWorker {
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteApi>,
    user_id: Option<i64>,
    machine_id: String,
    interval: Duration,
    notify: Arc<Notify>,
    health: Arc<Mutex<SyncHealth>>,
}

impl SyncWorker {
    pub fn new(
        local: Arc<LocalStore>,
        remote: Arc<dyn RemoteApi>,
        user_id: Option<i64>,
        machine_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            local,
            remote,
            user_id,
            machine_id: machine_id.into(),
            interval,
            notify: Arc::new(Notify::new()),
            health: Arc::new(Mutex::new(SyncHealth::default())),
        }
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            notify: Arc::clone(&self.notify),
            health: Arc::clone(&self.health),
        }
    }

    /// Run until `cancel` fires.  Wakes on the configured period and on
    /// every `force_sync`.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval() fires immediately; consume that so startup is quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
            }
            self.cycle(&cancel).await;
        }
    }

    /// One push-then-pull reconciliation pass.  Every remote await honours
    /// the cancellation token; local durability is never rolled back.
    pub async fn cycle(&self, cancel: &CancellationToken) {
        if let Err(e) = self.push(cancel).await {
            if !matches!(e, StoreError::Aborted) {
                warn!("sync push failed: {e}");
                self.set_error(e.to_string());
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.pull(cancel).await {
            if !matches!(e, StoreError::Aborted) {
                warn!("sync pull failed: {e}");
                self.set_error(e.to_string());
            }
        }
        if let Ok(pending) = self.local.sync_pending_count() {
            self.with_health(|h| h.pending = pending as u64);
        }
    }

    async fn push(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        let batch = self.local.sync_due_batch(BATCH_SIZE)?;
        for (seq, op, attempts) in batch {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Aborted),
                r = self.remote.apply(&op) => r,
            };
            match result {
                Ok(()) => {
                    self.local.sync_mark_done(seq)?;
                    self.with_health(|h| {
                        h.pushed += 1;
                        h.last_error = None;
                    });
                }
                Err(e) => {
                    debug!(seq, attempts, "push attempt failed: {e}");
                    let dead = self.local.sync_mark_failed(seq, &e.to_string(), MAX_RETRIES)?;
                    self.with_health(|h| {
                        if dead {
                            h.dead_lettered += 1;
                        }
                        h.last_error = Some(e.to_string());
                    });
                }
            }
        }
        Ok(())
    }

    async fn pull(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        let watermark = self.local.pull_watermark()?;
        let turns = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StoreError::Aborted),
            r = self.remote.pull_turns_since(watermark, self.user_id, &self.machine_id) => r?,
        };
        let mut new_watermark = watermark;
        let mut merged = 0u64;
        for turn in &turns {
            self.local.merge_remote_turn(turn)?;
            new_watermark = new_watermark.max(turn.lww_stamp());
            merged += 1;
        }
        if new_watermark != watermark {
            self.local.set_pull_watermark(new_watermark)?;
        }
        if merged > 0 {
            debug!(merged, new_watermark, "pulled remote turns");
            self.with_health(|h| h.pulled += merged);
        }
        Ok(())
    }

    fn with_health(&self, f: impl FnOnce(&mut SyncHealth)) {
        let mut h = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut h);
    }

    fn set_error(&self, msg: String) {
        self.with_health(|h| h.last_error = Some(msg));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::types::{NewTurn, Partition, TurnStatus};

    /// In-memory remote: records applied ops, serves scripted pulls.
    #[derive(Default)]
    struct FakeRemote {
        applied: Mutex<Vec<SyncOp>>,
        pull_rows: Mutex<Vec<TurnRecord>>,
        fail_apply: AtomicBool,
    }

    #[async_trait]
    impl RemoteApi for FakeRemote {
        async fn apply(&self, op: &SyncOp) -> Result<(), StoreError> {
            if self.fail_apply.load(Ordering::Relaxed) {
                return Err(StoreError::Remote("unreachable".into()));
            }
            self.applied.lock().unwrap().push(op.clone());
            Ok(())
        }

        async fn pull_turns_since(
            &self,
            watermark: i64,
            _user_id: Option<i64>,
            _machine_id: &str,
        ) -> Result<Vec<TurnRecord>, StoreError> {
            if self.fail_apply.load(Ordering::Relaxed) {
                return Err(StoreError::Remote("unreachable".into()));
            }
            Ok(self
                .pull_rows
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.lww_stamp() > watermark)
                .cloned()
                .collect())
        }
    }

    fn seeded_local() -> Arc<LocalStore> {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        local
            .record_turn(NewTurn {
                id: "t1".into(),
                command: "uptime".into(),
                user_id: None,
                machine_id: "m1".into(),
                session_id: None,
                timestamp: 100,
                request_id: "r1".into(),
                context: None,
            })
            .unwrap();
        local
    }

    fn worker(local: Arc<LocalStore>, remote: Arc<FakeRemote>) -> SyncWorker {
        SyncWorker::new(local, remote, None, "m1", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn cycle_pushes_queue_in_order_and_drains_it() {
        let local = seeded_local();
        let remote = Arc::new(FakeRemote::default());
        let w = worker(Arc::clone(&local), Arc::clone(&remote));

        w.cycle(&CancellationToken::new()).await;

        let applied = remote.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert!(matches!(&applied[0], SyncOp::UpsertTurn(t) if t.request_id == "r1"));
        drop(applied);
        assert_eq!(local.sync_pending_count().unwrap(), 0);
        assert_eq!(w.handle().health().pushed, 1);
    }

    #[tokio::test]
    async fn transport_failure_keeps_entry_and_records_error() {
        let local = seeded_local();
        let remote = Arc::new(FakeRemote::default());
        remote.fail_apply.store(true, Ordering::Relaxed);
        let w = worker(Arc::clone(&local), Arc::clone(&remote));

        w.cycle(&CancellationToken::new()).await;

        assert_eq!(local.sync_pending_count().unwrap(), 1);
        let health = w.handle().health();
        assert!(health.last_error.is_some());
        assert_eq!(health.pushed, 0);
    }

    #[tokio::test]
    async fn pull_merges_rows_and_advances_watermark() {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let remote = Arc::new(FakeRemote::default());
        remote.pull_rows.lock().unwrap().push(TurnRecord {
            id: "remote-1".into(),
            command: "free -m".into(),
            response: Some("ok".into()),
            user_id: None,
            machine_id: "m1".into(),
            session_id: None,
            timestamp: 500,
            status: TurnStatus::Completed,
            request_id: "rr1".into(),
            updated_at: Some(510),
            completed_at: Some(510),
            tokens_used: None,
            execution_time_ms: None,
            error_code: None,
            context: None,
        });
        let w = worker(Arc::clone(&local), Arc::clone(&remote));

        w.cycle(&CancellationToken::new()).await;

        assert_eq!(local.pull_watermark().unwrap(), 510);
        let turns = local.read_recent_turns(&Partition::Global, 10, None).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].request_id, "rr1");

        // A second cycle pulls nothing new.
        w.cycle(&CancellationToken::new()).await;
        assert_eq!(w.handle().health().pulled, 1);
    }

    #[tokio::test]
    async fn cancelled_cycle_aborts_without_losing_queue_entries() {
        let local = seeded_local();
        let remote = Arc::new(FakeRemote::default());
        let w = worker(Arc::clone(&local), Arc::clone(&remote));

        let cancel = CancellationToken::new();
        cancel.cancel();
        w.cycle(&cancel).await;

        // Nothing pushed, nothing lost: offline mode keeps data local.
        assert_eq!(local.sync_pending_count().unwrap(), 1);
        assert!(remote.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_sync_wakes_the_run_loop() {
        let local = seeded_local();
        let remote = Arc::new(FakeRemote::default());
        let w = worker(Arc::clone(&local), Arc::clone(&remote));
        let handle = w.handle();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(w.run(cancel.clone()));
        handle.force_sync();
        // Wait for the worker to drain the queue, then stop it.
        for _ in 0..100 {
            if handle.health().pushed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(handle.health().pushed, 1);
    }
}
