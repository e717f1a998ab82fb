//! The sync engine: push/pull cycles, retry policy and status reporting.
//!
//! States move `Idle -> Syncing -> Idle | BackingOff`, with `Degraded`
//! reported once failures persist. Triggers (interval tick, local write,
//! remote notification, manual request) that arrive while a cycle is running
//! collapse into a single follow-up cycle.

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::{SyncError, TransportError};
use crate::replica::{now_ms, Replica};
use crate::status::{DegradedReason, SyncState, SyncStatus};
use crate::transport::{RemoteChange, SyncTransport};
use std::sync::Arc;
use std::time::Duration;
use tandem_engine::{ChangeEntry, ConflictNotice, SyncBatch};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one successful cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Local entries sent
    pub pushed: usize,
    /// Of those, entries the authority already had
    pub duplicates: usize,
    /// Remote entries received (own echoes excluded)
    pub pulled: usize,
    /// Remote entries that changed the store
    pub applied: usize,
    /// Pull pages fetched
    pub pages: usize,
    pub notices: Vec<ConflictNotice>,
    /// Settled log entries dropped
    pub compacted: usize,
    pub tombstones_collected: usize,
    /// Work left for a follow-up cycle (batch cap or page cap reached)
    pub more_pending: bool,
}

/// Orchestrates sync for one replica over one transport.
pub struct SyncEngine {
    replica: Replica,
    transport: Arc<dyn SyncTransport>,
    config: SyncConfig,
    status: watch::Sender<SyncStatus>,
    wake: Arc<Notify>,
    manual: Arc<Notify>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("replica", &self.replica)
            .field("transport", &self.transport.kind())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(replica: Replica, transport: Arc<dyn SyncTransport>, config: SyncConfig) -> Self {
        let initial = SyncStatus {
            pending: replica.pending_count(),
            ..SyncStatus::default()
        };
        let (status, _) = watch::channel(initial);
        let wake = replica.local_changes();
        Self {
            replica,
            transport,
            config,
            status,
            wake,
            manual: Arc::new(Notify::new()),
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Run one push/pull cycle and record the outcome in the status.
    ///
    /// Checkpoints only advance after the matching round trip succeeded, so
    /// an abandoned or failed cycle is simply repeated by the next one.
    pub async fn sync_once(&self) -> Result<SyncReport, SyncError> {
        self.status.send_modify(|s| s.state = SyncState::Syncing);
        let started = Instant::now();

        let result = self.cycle().await;
        let pending = self.replica.pending_count();

        match &result {
            Ok(report) => {
                debug!(
                    pushed = report.pushed,
                    pulled = report.pulled,
                    applied = report.applied,
                    pending,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sync cycle complete"
                );
                self.status.send_modify(|s| {
                    s.state = SyncState::Idle;
                    s.last_error = None;
                    s.consecutive_failures = 0;
                    s.pending = pending;
                    s.last_synced_at = Some(now_ms());
                });
            }
            Err(err) => {
                match err {
                    SyncError::Transport(e) => warn!(error = %e, "sync cycle failed"),
                    other => error!(error = %other, "sync cycle failed"),
                }
                let degraded_after = self.config.degraded_after;
                self.status.send_modify(|s| {
                    s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                    s.last_error = Some(err.class());
                    s.pending = pending;
                    s.state = match DegradedReason::from_error(err) {
                        Some(reason @ DegradedReason::Rejected { .. }) => {
                            SyncState::Degraded { reason }
                        }
                        Some(reason) if s.consecutive_failures >= degraded_after => {
                            SyncState::Degraded { reason }
                        }
                        _ => SyncState::Idle,
                    };
                });
            }
        }
        result
    }

    async fn cycle(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        self.push(&mut report).await?;
        self.pull(&mut report).await?;
        self.housekeeping(&mut report)?;

        Ok(report)
    }

    async fn push(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let (batch, more): (Vec<ChangeEntry>, bool) = {
            let state = self.replica.lock();
            let mut pending = state.log.entries_since(&state.checkpoint.last_acked_clock);
            let batch = pending
                .by_ref()
                .take(self.config.max_batch_size)
                .cloned()
                .collect();
            (batch, pending.next().is_some())
        };
        if batch.is_empty() {
            return Ok(());
        }

        let count = batch.len();
        let ack = self.transport.push(SyncBatch::push(batch)).await?;

        let mut state = self.replica.lock();
        state.checkpoint.last_acked_clock.merge(&ack.watermark);
        state.log.mark_settled(&ack.watermark);
        self.replica.save_checkpoint(&state)?;

        report.pushed = count;
        report.duplicates = ack.duplicates;
        report.more_pending |= more;
        Ok(())
    }

    async fn pull(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let own = self.replica.id().clone();

        for _ in 0..self.config.max_pull_pages {
            let since = self.replica.lock().checkpoint.last_pulled_clock.clone();
            let page = self.transport.pull(&since, self.config.pull_limit).await?;
            report.pages += 1;

            let mut state = self.replica.lock();
            for entry in page.entries {
                if entry.origin_id == own {
                    continue;
                }
                report.pulled += 1;
                state.log.observe(entry.clock);
                let result = state.store.apply(entry)?;
                if result.applied {
                    report.applied += 1;
                }
                if let Some(notice) = result.notice {
                    warn!(
                        record_id = notice.record_id(),
                        notice = ?notice,
                        "conflict resolved"
                    );
                    report.notices.push(notice);
                }
            }

            self.replica.save_store(&state)?;
            state.checkpoint.last_pulled_clock.merge(&page.watermark);
            self.replica.save_checkpoint(&state)?;

            if !page.has_more {
                return Ok(());
            }
        }

        report.more_pending = true;
        Ok(())
    }

    /// Tombstone GC, store save and log compaction.
    fn housekeeping(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let mut state = self.replica.lock();

        let collected = state
            .store
            .collect_tombstones(now_ms(), self.config.tombstone_retention_ms);
        report.tombstones_collected = collected.len();

        // the store must hold every settled entry before the log forgets it
        self.replica.save_store(&state)?;
        report.compacted = state.log.compact(u64::MAX)?;
        if report.compacted > 0 {
            debug!(
                compacted = report.compacted,
                retained = state.log.len(),
                "change log compacted"
            );
        }
        Ok(())
    }

    /// Drive cycles until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            replica_id = %self.replica.id(),
            transport = %self.transport.kind(),
            poll_interval_ms = self.config.poll_interval_ms,
            "sync engine started"
        );

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = Backoff::new(self.config.backoff_policy());
        let mut remote = self.transport.remote_changes();
        let own = self.replica.id().clone();

        let mut retry_at: Option<Instant> = None;
        let mut halted = false;

        loop {
            let automatic = retry_at.is_none() && !halted;

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = self.manual.notified() => {
                    debug!("manual sync requested");
                    halted = false;
                }
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {}
                _ = ticker.tick(), if automatic => {}
                _ = self.wake.notified(), if automatic => {}
                change = next_remote_change(&mut remote), if automatic => match change {
                    Ok(change) if change.origin.as_ref() == Some(&own) => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        debug!("remote change signaled");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        remote = None;
                        continue;
                    }
                },
            }

            retry_at = None;
            match self.sync_once().await {
                Ok(report) => {
                    backoff.reset();
                    if report.more_pending {
                        self.wake.notify_one();
                    }
                }
                Err(SyncError::Transport(TransportError::Rejected { message, .. })) => {
                    backoff.reset();
                    halted = true;
                    warn!(%message, "authority rejected a batch, automatic sync halted");
                }
                Err(SyncError::Transport(_)) => {
                    let delay = backoff.next_delay();
                    retry_at = Some(Instant::now() + delay);
                    self.enter_backoff(backoff.attempt(), delay);
                }
                // persistence and engine faults are retried on the next tick
                Err(_) => {}
            }
        }

        self.status.send_modify(|s| {
            if s.state == SyncState::Syncing {
                s.state = SyncState::Idle;
            }
        });
        info!(replica_id = %self.replica.id(), "sync engine stopped");
    }

    fn enter_backoff(&self, attempt: u32, delay: Duration) {
        let delay_ms = delay.as_millis() as u64;
        warn!(attempt, delay_ms, "backing off");
        self.status.send_modify(|s| {
            if !s.is_degraded() {
                s.state = SyncState::BackingOff { attempt, delay_ms };
            }
        });
    }

    /// Run the engine on the current tokio runtime. Dropping every
    /// [`SyncHandle`] stops it like [`SyncHandle::shutdown`].
    pub fn spawn(self) -> (SyncHandle, JoinHandle<()>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = SyncHandle {
            manual: Arc::clone(&self.manual),
            status: self.subscribe_status(),
            shutdown: Arc::new(shutdown),
        };
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        (handle, task)
    }
}

async fn next_remote_change(
    remote: &mut Option<broadcast::Receiver<RemoteChange>>,
) -> Result<RemoteChange, broadcast::error::RecvError> {
    match remote {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Control handle for a spawned [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    manual: Arc<Notify>,
    status: watch::Receiver<SyncStatus>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SyncHandle {
    /// Start a cycle now, cutting any backoff short and lifting a halt.
    pub fn sync_now(&self) {
        self.manual.notify_one();
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop the engine after the in-flight cycle, if any.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BroadcastHub;
    use serde_json::json;

    fn engine(hub: &BroadcastHub, id: &str) -> SyncEngine {
        SyncEngine::new(
            Replica::in_memory(id).unwrap(),
            Arc::new(hub.connect()),
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn sync_once_pushes_and_settles() {
        let hub = BroadcastHub::default();
        let a = engine(&hub, "A");
        a.replica()
            .create("tickets", "t1", json!({"title": "Foo"}))
            .unwrap();

        let report = a.sync_once().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.pulled, 0);
        assert_eq!(report.compacted, 1);
        assert_eq!(hub.len(), 1);

        let status = a.status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.pending, 0);
        assert!(status.last_synced_at.is_some());
        assert_eq!(a.replica().checkpoint().last_acked_clock.get("tickets"), 1);
    }

    #[tokio::test]
    async fn batch_cap_leaves_work_for_next_cycle() {
        let hub = BroadcastHub::default();
        let replica = Replica::in_memory("A").unwrap();
        for i in 0..5 {
            replica
                .create("tickets", &format!("t{i}"), json!({"title": "x"}))
                .unwrap();
        }
        let config = SyncConfig {
            max_batch_size: 2,
            ..SyncConfig::default()
        };
        let a = SyncEngine::new(replica, Arc::new(hub.connect()), config);

        let report = a.sync_once().await.unwrap();
        assert_eq!(report.pushed, 2);
        assert!(report.more_pending);
        assert_eq!(a.status().pending, 3);

        a.sync_once().await.unwrap();
        let report = a.sync_once().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert!(!report.more_pending);
        assert_eq!(hub.len(), 5);
    }

    #[tokio::test]
    async fn pull_skips_own_echoes() {
        let hub = BroadcastHub::default();
        let a = engine(&hub, "A");
        let b = engine(&hub, "B");

        a.replica()
            .create("tickets", "t1", json!({"title": "Foo"}))
            .unwrap();
        a.sync_once().await.unwrap();

        let report = a.sync_once().await.unwrap();
        assert_eq!((report.pushed, report.pulled), (0, 0));

        let report = b.sync_once().await.unwrap();
        assert_eq!((report.pulled, report.applied), (1, 1));
        assert_eq!(b.replica().clock(), 1);
    }

    #[tokio::test]
    async fn failure_is_recorded_in_status() {
        let hub = BroadcastHub::default();
        let a = engine(&hub, "A");
        hub.set_offline(true);

        for expected in 1..=3u32 {
            assert!(a.sync_once().await.is_err());
            assert_eq!(a.status().consecutive_failures, expected);
        }
        assert_eq!(
            a.status().state,
            SyncState::Degraded {
                reason: DegradedReason::Unreachable
            }
        );

        hub.set_offline(false);
        a.sync_once().await.unwrap();
        let status = a.status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn rejected_batch_degrades_immediately() {
        let hub = BroadcastHub::default();
        let a = engine(&hub, "A");
        a.replica()
            .create("tickets", "t1", json!({"status": "open"}))
            .unwrap();

        let err = a.sync_once().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Transport(TransportError::Rejected { .. })
        ));
        assert!(a.status().is_halted());
        assert_eq!(a.status().pending, 1);
    }
}
