//! Connectivity Monitor
//!
//! Holds the single authoritative online/offline flag and turns platform
//! connectivity events into transitions. An offline→online transition starts
//! one reconnect drain; the first "online" seen after startup does not, unless
//! the process actually started offline.

use super::notifier::{Notifier, SyncNotification};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Raw connectivity signal from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub online: bool,
    /// Set once the process has observed itself offline; reset at startup
    pub has_been_offline: bool,
}

/// Effect of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Restored,
    Lost,
    Unchanged,
}

/// Invoked once per offline→online transition
#[async_trait]
pub trait ReconnectHandler: Send + Sync {
    async fn on_reconnect(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Connectivity monitor is already observing")]
    AlreadyRunning,

    #[error("Connectivity monitor is not observing")]
    NotRunning,
}

/// Process-wide connectivity state
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<ConnectivityState>>,
    notifier: Arc<dyn Notifier>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, notifier: Arc<dyn Notifier>) -> Self {
        let (state, _) = watch::channel(ConnectivityState {
            online: initially_online,
            has_been_offline: !initially_online,
        });

        Self {
            state: Arc::new(state),
            notifier,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().online
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Watch connectivity changes (for banners and indicators)
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Apply one platform event and notify on real transitions
    pub fn apply(&self, event: ConnectivityEvent) -> Transition {
        let mut transition = Transition::Unchanged;

        self.state.send_if_modified(|state| match event {
            ConnectivityEvent::Online if !state.online => {
                state.online = true;
                if state.has_been_offline {
                    transition = Transition::Restored;
                }
                true
            }
            ConnectivityEvent::Offline if state.online => {
                state.online = false;
                state.has_been_offline = true;
                transition = Transition::Lost;
                true
            }
            _ => false,
        });

        match transition {
            Transition::Restored => {
                log::info!("Network: ONLINE");
                self.notifier.notify(SyncNotification::ConnectionRestored);
            }
            Transition::Lost => {
                log::warn!("Network: OFFLINE");
                self.notifier.notify(SyncNotification::ConnectionLost);
            }
            Transition::Unchanged => {
                log::debug!("Network event {:?} did not change state", event);
            }
        }

        transition
    }

    /// Start consuming platform events on a background task
    ///
    /// Each restore spawns `handler.on_reconnect()` so later events are still
    /// applied while a drain runs.
    pub fn observe(
        &self,
        mut events: mpsc::Receiver<ConnectivityEvent>,
        handler: Arc<dyn ReconnectHandler>,
    ) -> Result<(), MonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyRunning);
        }

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            log::info!("Connectivity monitor started");

            while let Some(event) = events.recv().await {
                if monitor.apply(event) == Transition::Restored {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.on_reconnect().await;
                    });
                }
            }

            monitor.running.store(false, Ordering::SeqCst);
            log::info!("Connectivity event source closed, monitor stopped");
        });

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop observing platform events
    pub fn stop(&self) -> Result<(), MonitorError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(MonitorError::NotRunning);
        }

        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        log::info!("Connectivity monitor stopped");
        Ok(())
    }

    pub fn is_observing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::notifier::BroadcastNotifier;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingHandler {
        calls: AtomicUsize,
        signal: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl ReconnectHandler for CountingHandler {
        async fn on_reconnect(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.signal.send(());
        }
    }

    fn monitor(online: bool) -> (ConnectivityMonitor, BroadcastNotifier) {
        let notifier = BroadcastNotifier::new();
        (
            ConnectivityMonitor::new(online, Arc::new(notifier.clone())),
            notifier,
        )
    }

    #[test]
    fn test_initial_online_is_not_a_restore() {
        let (monitor, _) = monitor(true);

        assert!(monitor.is_online());
        assert!(!monitor.state().has_been_offline);
        assert_eq!(monitor.apply(ConnectivityEvent::Online), Transition::Unchanged);
    }

    #[test]
    fn test_offline_then_online_flips_flag() {
        let (monitor, notifier) = monitor(true);
        let mut rx = notifier.subscribe();

        assert_eq!(monitor.apply(ConnectivityEvent::Offline), Transition::Lost);
        assert!(!monitor.is_online());
        assert_eq!(monitor.apply(ConnectivityEvent::Offline), Transition::Unchanged);

        assert_eq!(monitor.apply(ConnectivityEvent::Online), Transition::Restored);
        assert!(monitor.is_online());
        assert_eq!(monitor.apply(ConnectivityEvent::Online), Transition::Unchanged);

        assert_eq!(rx.try_recv().unwrap(), SyncNotification::ConnectionLost);
        assert_eq!(rx.try_recv().unwrap(), SyncNotification::ConnectionRestored);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_starting_offline_counts_as_restore() {
        let (monitor, _) = monitor(false);

        assert!(!monitor.is_online());
        assert_eq!(monitor.apply(ConnectivityEvent::Online), Transition::Restored);
    }

    #[tokio::test]
    async fn test_observe_triggers_once_per_transition() {
        let (monitor, _) = monitor(true);
        let (signal, mut signals) = mpsc::unbounded_channel();
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            signal,
        });
        let (events, rx) = mpsc::channel(8);

        monitor.observe(rx, handler.clone()).unwrap();
        assert!(matches!(
            monitor.observe(mpsc::channel(1).1, handler.clone()),
            Err(MonitorError::AlreadyRunning)
        ));

        for event in [
            ConnectivityEvent::Online,
            ConnectivityEvent::Offline,
            ConnectivityEvent::Online,
            ConnectivityEvent::Online,
        ] {
            events.send(event).await.unwrap();
        }
        drop(events);

        tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("reconnect handler was not called")
            .unwrap();

        while monitor.is_observing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_stop() {
        let (monitor, _) = monitor(true);
        assert!(matches!(monitor.stop(), Err(MonitorError::NotRunning)));

        let (signal, _signals) = mpsc::unbounded_channel();
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            signal,
        });
        let (_events, rx) = mpsc::channel(1);

        monitor.observe(rx, handler).unwrap();
        assert!(monitor.is_observing());
        monitor.stop().unwrap();
        assert!(!monitor.is_observing());
    }
}
