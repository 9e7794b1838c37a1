//! Write Gateway - the enqueue path
//!
//! Every mutating operation goes through [`WriteGateway::submit`]:
//! - offline: the mutation is queued and a `Queued` outcome returned
//! - online: the mutation is applied remotely; a retryable failure queues it
//!   as a fallback and still reports the original error
//! - online, entity already has queued writes: queued behind them so replay
//!   order stays the order the writes were made
//! - online, non-retryable failure: reported as `Rejected`, nothing is queued

use super::api::{dispatch, RemoteError, RemoteStore};
use super::connectivity::ConnectivityMonitor;
use super::models::{Fields, Mutation, QueueItem, WriteOutcome};
use super::notifier::{Notifier, SyncNotification};
use super::queue::{MutationQueue, QueueError};
use std::sync::Arc;

#[derive(Clone)]
pub struct WriteGateway {
    remote: Arc<dyn RemoteStore>,
    queue: Arc<MutationQueue>,
    connectivity: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
}

impl WriteGateway {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        queue: Arc<MutationQueue>,
        connectivity: ConnectivityMonitor,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            remote,
            queue,
            connectivity,
            notifier,
        }
    }

    /// Apply a mutation now, or defer it to the queue
    ///
    /// Offline writes never reach the remote store and only fail when the
    /// queue itself cannot be written, as [`WriteError::Queue`].
    pub async fn submit(&self, mutation: Mutation) -> Result<WriteOutcome, WriteError> {
        if !self.connectivity.is_online() {
            log::info!("Offline, deferring {}", mutation.action());
            return self.defer(&mutation);
        }

        let waiting = self
            .queue
            .pending_for_entity(mutation.collection(), mutation.entity_id())?;
        if !waiting.is_empty() {
            log::info!(
                "{} {} has {} queued writes, deferring {} behind them",
                mutation.collection(),
                mutation.entity_id(),
                waiting.len(),
                mutation.action()
            );
            return self.defer(&mutation);
        }

        // Reused as the queue item's key if the call has to be deferred
        let idempotency_key = uuid::Uuid::new_v4().to_string();

        match dispatch(self.remote.as_ref(), &mutation, &idempotency_key).await {
            Ok(ack) => {
                log::info!("{} applied ({})", ack.action, ack.entity_id);
                Ok(WriteOutcome::Applied(ack))
            }
            Err(e) if e.is_retryable() => {
                log::warn!(
                    "{} failed: {}. Adding to queue for retry",
                    mutation.action(),
                    e
                );

                match self.enqueue_keyed(&mutation, &idempotency_key) {
                    Ok(item) => Err(WriteError::Deferred { item, source: e }),
                    Err(queue_err) => {
                        log::error!(
                            "Failed to add {} to queue after error ({}): {}",
                            mutation.action(),
                            e,
                            queue_err
                        );
                        Err(WriteError::Queue(queue_err))
                    }
                }
            }
            Err(e) => {
                log::error!("{} rejected by remote store: {}", mutation.action(), e);
                Err(WriteError::Rejected(e))
            }
        }
    }

    fn defer(&self, mutation: &Mutation) -> Result<WriteOutcome, WriteError> {
        match self.enqueue(mutation) {
            Ok(item) => Ok(WriteOutcome::Queued(item)),
            Err(e) => {
                log::error!("Failed to queue {}: {}", mutation.action(), e);
                Err(WriteError::Queue(e))
            }
        }
    }

    /// Queue a mutation unconditionally and announce it
    pub fn enqueue(&self, mutation: &Mutation) -> Result<QueueItem, QueueError> {
        self.enqueue_keyed(mutation, &uuid::Uuid::new_v4().to_string())
    }

    fn enqueue_keyed(&self, mutation: &Mutation, client_id: &str) -> Result<QueueItem, QueueError> {
        let item = self.queue.enqueue_with_client_id(mutation, client_id)?;

        self.notifier.notify(SyncNotification::Queued {
            item_id: item.id,
            action: mutation.action(),
        });

        Ok(item)
    }

    // ========================================================================
    // Typed write operations
    // ========================================================================

    pub async fn create_article(&self, data: Fields) -> Result<WriteOutcome, WriteError> {
        self.submit(Mutation::create_article(data)).await
    }

    pub async fn update_article(
        &self,
        id: impl Into<String>,
        changes: Fields,
    ) -> Result<WriteOutcome, WriteError> {
        self.submit(Mutation::UpdateArticle {
            id: id.into(),
            changes,
        })
        .await
    }

    pub async fn delete_article(&self, id: impl Into<String>) -> Result<WriteOutcome, WriteError> {
        self.submit(Mutation::DeleteArticle { id: id.into() }).await
    }

    pub async fn update_profile(
        &self,
        uid: impl Into<String>,
        changes: Fields,
    ) -> Result<WriteOutcome, WriteError> {
        self.submit(Mutation::UpdateProfile {
            uid: uid.into(),
            changes,
        })
        .await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The remote call failed transiently; the write is queued as `item`
    #[error("Saved for later sync after error: {source}")]
    Deferred { item: QueueItem, source: RemoteError },

    #[error("Rejected by remote store: {0}")]
    Rejected(#[source] RemoteError),
}

impl WriteError {
    /// Queue item holding the write, when it was deferred
    pub fn queued_item(&self) -> Option<&QueueItem> {
        match self {
            Self::Deferred { item, .. } => Some(item),
            _ => None,
        }
    }
}
