//! Sync Reconciler
//!
//! Drains the mutation queue against the remote store, oldest item first, one
//! replay at a time. A failing item is retried on a later pass with
//! exponential backoff between items; once its budget is spent (or the
//! failure can never succeed) it is moved to the dead-letter list and its
//! error surfaced.

use super::api::{dispatch, RemoteError, RemoteStore};
use super::connectivity::{ConnectivityMonitor, ReconnectHandler};
use super::models::QueueItem;
use super::notifier::{Notifier, SyncNotification};
use super::queue::{MutationQueue, QueueError};
use crate::config::SyncPolicy;
use crate::db::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::Mutex;

const LAST_COMPLETED_KEY: &str = "sync_last_completed";

/// Counters for one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Replays issued (an item retried across passes counts each time)
    pub attempted: usize,
    pub succeeded: usize,
    /// Failures kept in the queue for a later pass
    pub retried: usize,
    /// Items moved to the dead-letter list
    pub dropped: usize,
    pub errors: Vec<String>,
}

impl DrainReport {
    fn absorb(&mut self, pass: DrainReport) {
        self.attempted += pass.attempted;
        self.succeeded += pass.succeeded;
        self.retried += pass.retried;
        self.dropped += pass.dropped;
        self.errors.extend(pass.errors);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain held the guard
    Skipped,
    /// Not started because the process is offline
    Offline,
    Completed(DrainReport),
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Clears the syncing flag however the drain ends
struct SyncingFlag<'a>(&'a AtomicBool);

impl<'a> SyncingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SyncingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncReconciler {
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
    db: Arc<Database>,
    policy: SyncPolicy,
    /// Single-flight guard: held for the whole drain
    drain_lock: Mutex<()>,
    syncing: AtomicBool,
    last_errors: StdRwLock<Vec<String>>,
    last_completed_at: StdRwLock<Option<DateTime<Utc>>>,
    drains_started: AtomicU64,
}

impl SyncReconciler {
    pub fn new(
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        notifier: Arc<dyn Notifier>,
        db: Arc<Database>,
        policy: SyncPolicy,
    ) -> Self {
        let last_completed_at = match db.get_setting::<DateTime<Utc>>(LAST_COMPLETED_KEY) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to load last sync time: {}", e);
                None
            }
        };

        Self {
            queue,
            remote,
            connectivity,
            notifier,
            db,
            policy,
            drain_lock: Mutex::new(()),
            syncing: AtomicBool::new(false),
            last_errors: StdRwLock::new(Vec::new()),
            last_completed_at: StdRwLock::new(last_completed_at),
            drains_started: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Permanent failures recorded by the most recent drain
    pub fn last_sync_errors(&self) -> Vec<String> {
        self.last_errors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_completed_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_completed_at
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Number of drains that got past the single-flight guard
    pub fn drains_started(&self) -> u64 {
        self.drains_started.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Draining
    // ========================================================================

    /// Run one pass over the queue
    ///
    /// A no-op returning `Skipped` while another drain is running.
    pub async fn drain(&self) -> Result<DrainOutcome, SyncError> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            log::debug!("Drain already in progress, skipping");
            return Ok(DrainOutcome::Skipped);
        };
        if !self.connectivity.is_online() {
            log::info!("Offline, not draining queue");
            return Ok(DrainOutcome::Offline);
        }

        let _syncing = SyncingFlag::raise(&self.syncing);
        self.drains_started.fetch_add(1, Ordering::SeqCst);
        self.clear_errors();

        let report = self.run_pass(true).await?;
        self.finish(&report);

        Ok(DrainOutcome::Completed(report))
    }

    /// Run passes back to back until nothing is left awaiting retry
    ///
    /// Stops early when connectivity drops. Shares the guard with [`drain`].
    ///
    /// [`drain`]: SyncReconciler::drain
    pub async fn drain_until_settled(&self) -> Result<DrainOutcome, SyncError> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            log::debug!("Drain already in progress, skipping");
            return Ok(DrainOutcome::Skipped);
        };
        if !self.connectivity.is_online() {
            log::info!("Offline, not draining queue");
            return Ok(DrainOutcome::Offline);
        }

        let _syncing = SyncingFlag::raise(&self.syncing);
        self.drains_started.fetch_add(1, Ordering::SeqCst);
        self.clear_errors();

        let mut total = DrainReport::default();
        let mut first = true;
        loop {
            let pass = self.run_pass(first).await?;
            first = false;

            let again = pass.retried > 0 && self.connectivity.is_online();
            total.absorb(pass);
            if !again {
                break;
            }
            log::debug!("Items awaiting retry, starting another pass");
        }

        self.finish(&total);
        Ok(DrainOutcome::Completed(total))
    }

    async fn run_pass(&self, announce: bool) -> Result<DrainReport, SyncError> {
        let items = self.queue.pending_items()?;
        let mut report = DrainReport::default();

        if items.is_empty() {
            log::info!("No pending mutations to replay");
            return Ok(report);
        }

        log::info!("Replaying {} pending mutations", items.len());
        if announce {
            self.notifier.notify(SyncNotification::SyncStarted {
                pending: items.len(),
            });
        }

        for item in items {
            report.attempted += 1;
            self.replay(&item, &mut report).await;
        }

        log::info!(
            "Pass complete: {} succeeded, {} awaiting retry, {} dropped",
            report.succeeded,
            report.retried,
            report.dropped
        );
        Ok(report)
    }

    /// Replay one item; every failure is contained here
    async fn replay(&self, item: &QueueItem, report: &mut DrainReport) {
        let mutation = match item.mutation() {
            Ok(mutation) => mutation,
            Err(e) => {
                log::error!("Queue item {} cannot be replayed: {}", item.id, e);
                self.drop_item(item, format!("Queue item {}: {}", item.id, e), report);
                return;
            }
        };

        match dispatch(self.remote.as_ref(), &mutation, &item.client_id).await {
            Ok(ack) => {
                log::info!(
                    "Queue item {} replayed successfully ({} {})",
                    item.id,
                    ack.action,
                    ack.entity_id
                );
                if let Err(e) = self.queue.remove(item.id) {
                    log::error!("Failed to remove replayed item {}: {}", item.id, e);
                }
                report.succeeded += 1;
            }
            Err(e) if e.is_retryable() && item.retry_count < self.policy.max_retries => {
                self.schedule_retry(item, &e, report).await;
            }
            Err(e) => {
                let message = if e.is_retryable() {
                    format!(
                        "{} failed after {} retries: {}",
                        item.action, item.retry_count, e
                    )
                } else {
                    format!("{} rejected: {}", item.action, e)
                };
                self.drop_item(item, message, report);
            }
        }
    }

    async fn schedule_retry(&self, item: &QueueItem, error: &RemoteError, report: &mut DrainReport) {
        let retry_count = match self.queue.increment_retry(item.id, &error.to_string()) {
            Ok(count) => count,
            Err(e) => {
                log::error!("Failed to record retry for item {}: {}", item.id, e);
                return;
            }
        };
        report.retried += 1;

        let delay = self.policy.backoff_delay(retry_count);
        log::warn!(
            "Queue item {} failed (retry {}/{}): {}. Waiting {:?}",
            item.id,
            retry_count,
            self.policy.max_retries,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
    }

    fn drop_item(&self, item: &QueueItem, message: String, report: &mut DrainReport) {
        if let Err(e) = self.queue.move_to_failed(item, &message) {
            log::error!("Failed to move item {} to failed list: {}", item.id, e);
        }
        report.dropped += 1;
        report.errors.push(message);
    }

    fn clear_errors(&self) {
        self.last_errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn finish(&self, report: &DrainReport) {
        let completed_at = Utc::now();

        *self.last_errors.write().unwrap_or_else(|e| e.into_inner()) = report.errors.clone();
        *self
            .last_completed_at
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(completed_at);

        if let Err(e) = self.db.set_setting(LAST_COMPLETED_KEY, &completed_at) {
            log::warn!("Failed to persist last sync time: {}", e);
        }

        if !report.errors.is_empty() {
            self.notifier.notify(SyncNotification::SyncFinishedWithErrors {
                errors: report.errors.clone(),
            });
        } else if report.attempted > 0 {
            match self.queue.pending_count() {
                Ok(0) => self.notifier.notify(SyncNotification::SyncCompleted {
                    replayed: report.succeeded,
                }),
                Ok(remaining) => log::info!("{} mutations still pending", remaining),
                Err(e) => log::warn!("Failed to count pending mutations: {}", e),
            }
        }
    }
}

#[async_trait]
impl ReconnectHandler for SyncReconciler {
    async fn on_reconnect(&self) {
        match self.drain_until_settled().await {
            Ok(DrainOutcome::Completed(report)) => log::info!(
                "Reconnect sync finished: {} replayed, {} dropped",
                report.succeeded,
                report.dropped
            ),
            Ok(outcome) => log::debug!("Reconnect sync not run: {:?}", outcome),
            Err(e) => log::error!("Reconnect sync failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::Mutation;
    use crate::sync::notifier::BroadcastNotifier;
    use crate::sync::tests::{fields, MockRemote};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        reconciler: Arc<SyncReconciler>,
        remote: Arc<MockRemote>,
        queue: Arc<MutationQueue>,
        db: Arc<Database>,
        connectivity: ConnectivityMonitor,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = Arc::new(MutationQueue::new(db.clone()).unwrap());
        let remote = Arc::new(MockRemote::new());
        let notifier: Arc<dyn Notifier> = Arc::new(BroadcastNotifier::new());
        let connectivity = ConnectivityMonitor::new(true, notifier.clone());
        let reconciler = Arc::new(SyncReconciler::new(
            queue.clone(),
            remote.clone(),
            connectivity.clone(),
            notifier,
            db.clone(),
            SyncPolicy::default(),
        ));

        Fixture {
            reconciler,
            remote,
            queue,
            db,
            connectivity,
        }
    }

    fn update(id: &str) -> Mutation {
        Mutation::UpdateArticle {
            id: id.to_string(),
            changes: fields(json!({"title": id})),
        }
    }

    #[tokio::test]
    async fn test_empty_drain() {
        let f = fixture();

        let outcome = f.reconciler.drain().await.unwrap();

        assert_eq!(outcome, DrainOutcome::Completed(DrainReport::default()));
        assert!(!f.reconciler.is_syncing());
        assert!(f.reconciler.last_completed_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_stays_for_next_pass() {
        let f = fixture();
        f.queue.enqueue(&update("a1")).unwrap();
        f.queue.enqueue(&update("a2")).unwrap();
        f.remote.fail_next(RemoteError::Server("502".to_string()));

        let start = tokio::time::Instant::now();
        let report = f.reconciler.drain().await.unwrap().report().cloned().unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.retried, 1);
        // base * 2^1 after the first failure
        assert!(start.elapsed() >= Duration::from_secs(2));

        let pending = f.queue.pending_items().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
        assert!(f.reconciler.last_sync_errors().is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_dropped_immediately() {
        let f = fixture();
        f.queue.enqueue(&update("a1")).unwrap();
        f.remote.fail_next(RemoteError::Validation("title required".to_string()));

        let report = f.reconciler.drain().await.unwrap().report().cloned().unwrap();

        assert_eq!(report.dropped, 1);
        assert_eq!(f.queue.pending_count().unwrap(), 0);
        assert_eq!(f.queue.failed_count().unwrap(), 1);
        assert_eq!(f.reconciler.last_sync_errors().len(), 1);
        assert!(f.reconciler.last_sync_errors()[0].contains("title required"));
    }

    #[tokio::test]
    async fn test_unknown_action_is_fatal_for_item_only() {
        let f = fixture();
        f.db.execute(
            "INSERT INTO mutation_queue (client_id, action, payload, enqueued_at, retry_count, updated_at)
             VALUES ('c0', 'PublishArticle', '{}', '2024-01-01T00:00:00+00:00', 0, '2024-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        f.queue.enqueue(&update("a1")).unwrap();

        let report = f.reconciler.drain().await.unwrap().report().cloned().unwrap();

        assert_eq!(report.dropped, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(f.remote.calls(), vec!["update articles/a1".to_string()]);
        assert!(f.reconciler.last_sync_errors()[0].contains("PublishArticle"));
    }

    #[tokio::test]
    async fn test_offline_drain_does_nothing() {
        let f = fixture();
        f.queue.enqueue(&update("a1")).unwrap();
        f.connectivity
            .apply(crate::sync::connectivity::ConnectivityEvent::Offline);

        assert_eq!(f.reconciler.drain().await.unwrap(), DrainOutcome::Offline);
        assert_eq!(f.remote.call_count(), 0);
        assert_eq!(f.reconciler.drains_started(), 0);
    }

    #[tokio::test]
    async fn test_last_completed_persisted() {
        let f = fixture();
        f.reconciler.drain().await.unwrap();
        let completed = f.reconciler.last_completed_at();

        let reloaded = SyncReconciler::new(
            f.queue.clone(),
            f.remote.clone(),
            f.connectivity.clone(),
            Arc::new(BroadcastNotifier::new()),
            f.db.clone(),
            SyncPolicy::default(),
        );

        assert_eq!(reloaded.last_completed_at(), completed);
    }
}
