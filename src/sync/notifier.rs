//! User-visible sync notifications
//!
//! The subsystem never prompts the user itself; it emits notifications that a
//! UI layer renders (toast, banner, retry affordance).

use super::models::MutationAction;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotification {
    /// A write was stored for later replay
    Queued { item_id: i64, action: MutationAction },
    /// A drain started with this many pending items
    SyncStarted { pending: usize },
    /// A drain replayed everything it attempted and left the queue empty
    SyncCompleted { replayed: usize },
    /// A drain dropped at least one item permanently
    SyncFinishedWithErrors { errors: Vec<String> },
    ConnectionLost,
    ConnectionRestored,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: SyncNotification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: SyncNotification) {
        match notification {
            SyncNotification::Queued { item_id, action } => {
                log::info!("{} saved offline (item {}), will sync when online", action, item_id)
            }
            SyncNotification::SyncStarted { pending } => {
                log::info!("Syncing {} pending change(s)", pending)
            }
            SyncNotification::SyncCompleted { replayed } => {
                log::info!("All changes synced ({} replayed)", replayed)
            }
            SyncNotification::SyncFinishedWithErrors { errors } => {
                for error in &errors {
                    log::error!("Sync error: {}", error);
                }
            }
            SyncNotification::ConnectionLost => log::warn!("Connection lost, working offline"),
            SyncNotification::ConnectionRestored => log::info!("Connection restored"),
        }
    }
}

/// Fans notifications out to any number of UI subscribers
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<SyncNotification>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notification: SyncNotification) {
        log::debug!("Notification: {:?}", notification);
        // No subscribers is fine
        let _ = self.sender.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.notify(SyncNotification::ConnectionLost);

        assert_eq!(first.recv().await.unwrap(), SyncNotification::ConnectionLost);
        assert_eq!(second.recv().await.unwrap(), SyncNotification::ConnectionLost);
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let notifier = BroadcastNotifier::new();
        notifier.notify(SyncNotification::SyncCompleted { replayed: 0 });

        let mut late = notifier.subscribe();
        assert!(late.try_recv().is_err());
    }
}
