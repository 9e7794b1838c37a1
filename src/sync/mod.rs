//! Sync Module - Offline Mutation Queue
//!
//! Keeps writes durable while offline and replays them when connectivity
//! returns:
//! - Connectivity: single online flag plus a "has been offline" session flag
//! - Gateway: applies writes or defers them to the queue
//! - Queue: SQLite-backed FIFO with a dead-letter list
//! - Reconciler: single-flight drain with bounded retries and backoff

pub mod api;
pub mod connectivity;
pub mod gateway;
pub mod manager;
pub mod models;
pub mod notifier;
pub mod queue;
pub mod reconciler;


// Re-export commonly used types
pub use models::{
    FailedMutation, Fields, Mutation, MutationAction, MutationDecodeError, QueueItem, RemoteAck,
    SyncStatus, WriteOutcome, ARTICLES_COLLECTION, PROFILES_COLLECTION,
};

pub use api::{dispatch, EntityPage, HttpRemoteStore, PageRequest, RemoteError, RemoteStore};
pub use connectivity::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivityState, MonitorError, ReconnectHandler,
    Transition,
};
pub use gateway::{WriteError, WriteGateway};
pub use manager::{OfflineSync, SyncManagerError};
pub use notifier::{BroadcastNotifier, LogNotifier, Notifier, SyncNotification};
pub use queue::{MutationQueue, QueueError, QueueStats};
pub use reconciler::{DrainOutcome, DrainReport, SyncError, SyncReconciler};
