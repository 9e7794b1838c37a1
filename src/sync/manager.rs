//! Offline Sync Manager - main orchestrator
//!
//! Owns the queue, connectivity monitor, write gateway and reconciler, and
//! exposes the narrow API the rest of the application uses:
//! `enqueue`, `is_online`, `is_syncing`, `pending_count`, `last_sync_errors`.

use super::api::RemoteStore;
use super::connectivity::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivityState, MonitorError, ReconnectHandler,
    Transition,
};
use super::gateway::{WriteError, WriteGateway};
use super::models::{
    FailedMutation, Mutation, MutationDecodeError, QueueItem, SyncStatus, WriteOutcome,
};
use super::notifier::Notifier;
use super::queue::{MutationQueue, QueueError, QueueStats};
use super::reconciler::{DrainOutcome, SyncError, SyncReconciler};
use crate::config::{ConfigError, SyncPolicy};
use crate::db::Database;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Offline sync facade
#[derive(Clone)]
pub struct OfflineSync {
    queue: Arc<MutationQueue>,
    connectivity: ConnectivityMonitor,
    gateway: WriteGateway,
    reconciler: Arc<SyncReconciler>,
}

impl OfflineSync {
    /// Create with the persisted sync policy
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        notifier: Arc<dyn Notifier>,
        initially_online: bool,
    ) -> Result<Self, SyncManagerError> {
        let policy = SyncPolicy::load(&db)?;
        Self::with_policy(db, remote, notifier, initially_online, policy)
    }

    pub fn with_policy(
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        notifier: Arc<dyn Notifier>,
        initially_online: bool,
        policy: SyncPolicy,
    ) -> Result<Self, SyncManagerError> {
        policy.validate()?;

        let queue = Arc::new(MutationQueue::new(db.clone())?);
        let connectivity = ConnectivityMonitor::new(initially_online, notifier.clone());
        let gateway = WriteGateway::new(
            remote.clone(),
            queue.clone(),
            connectivity.clone(),
            notifier.clone(),
        );
        let reconciler = Arc::new(SyncReconciler::new(
            queue.clone(),
            remote,
            connectivity.clone(),
            notifier,
            db,
            policy,
        ));

        log::info!(
            "Offline sync initialized (online: {}, max retries: {})",
            initially_online,
            policy.max_retries
        );

        Ok(Self {
            queue,
            connectivity,
            gateway,
            reconciler,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start observing connectivity events
    ///
    /// Items left over from a previous run are replayed right away when the
    /// process starts online.
    pub fn start(&self, events: mpsc::Receiver<ConnectivityEvent>) -> Result<(), SyncManagerError> {
        self.connectivity.observe(events, self.reconciler.clone())?;

        if self.connectivity.is_online() {
            let pending = self.queue.pending_count()?;
            if pending > 0 {
                log::info!("Resuming sync of {} mutations from a previous session", pending);
                let reconciler = self.reconciler.clone();
                tokio::spawn(async move {
                    reconciler.on_reconnect().await;
                });
            }
        }

        Ok(())
    }

    pub fn stop(&self) -> Result<(), SyncManagerError> {
        self.connectivity.stop()?;
        Ok(())
    }

    /// Feed a connectivity event directly, bypassing the observer task
    ///
    /// Must be called within a tokio runtime: a restore spawns the drain.
    pub fn apply_connectivity(&self, event: ConnectivityEvent) -> Transition {
        let transition = self.connectivity.apply(event);
        if transition == Transition::Restored {
            let reconciler = self.reconciler.clone();
            tokio::spawn(async move {
                reconciler.on_reconnect().await;
            });
        }
        transition
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity.subscribe()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append a mutation by action tag and payload
    pub fn enqueue(&self, action: &str, payload: Value) -> Result<QueueItem, SyncManagerError> {
        let mutation = Mutation::from_parts(action, payload)?;
        Ok(self.gateway.enqueue(&mutation)?)
    }

    pub async fn submit(&self, mutation: Mutation) -> Result<WriteOutcome, WriteError> {
        self.gateway.submit(mutation).await
    }

    pub fn gateway(&self) -> &WriteGateway {
        &self.gateway
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.reconciler.is_syncing()
    }

    pub fn pending_count(&self) -> Result<usize, SyncManagerError> {
        Ok(self.queue.pending_count()?)
    }

    pub fn last_sync_errors(&self) -> Vec<String> {
        self.reconciler.last_sync_errors()
    }

    pub fn drains_started(&self) -> u64 {
        self.reconciler.drains_started()
    }

    pub fn status(&self) -> Result<SyncStatus, SyncManagerError> {
        Ok(SyncStatus {
            online: self.is_online(),
            syncing: self.is_syncing(),
            pending: self.queue.pending_count()?,
            failed: self.queue.failed_count()?,
            last_errors: self.last_sync_errors(),
            last_completed_at: self.reconciler.last_completed_at(),
        })
    }

    pub fn queue_stats(&self) -> Result<QueueStats, SyncManagerError> {
        Ok(self.queue.stats()?)
    }

    pub fn pending_items(&self) -> Result<Vec<QueueItem>, SyncManagerError> {
        Ok(self.queue.pending_items()?)
    }

    // ========================================================================
    // Draining
    // ========================================================================

    /// One pass over the queue
    pub async fn drain(&self) -> Result<DrainOutcome, SyncManagerError> {
        Ok(self.reconciler.drain().await?)
    }

    pub async fn drain_until_settled(&self) -> Result<DrainOutcome, SyncManagerError> {
        Ok(self.reconciler.drain_until_settled().await?)
    }

    // ========================================================================
    // Permanent failures
    // ========================================================================

    pub fn failed_mutations(&self) -> Result<Vec<FailedMutation>, SyncManagerError> {
        Ok(self.queue.failed_items()?)
    }

    /// Put a failed mutation back in the queue (the UI "Retry" action)
    pub fn retry_failed(&self, failed_id: i64) -> Result<QueueItem, SyncManagerError> {
        Ok(self.queue.requeue_failed(failed_id)?)
    }

    pub fn dismiss_failed(&self, failed_id: i64) -> Result<(), SyncManagerError> {
        Ok(self.queue.dismiss_failed(failed_id)?)
    }

    pub fn clear_failed(&self) -> Result<usize, SyncManagerError> {
        Ok(self.queue.clear_failed()?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(#[from] MutationDecodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}
