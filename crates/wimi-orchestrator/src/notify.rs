use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};
use wimi_core::{Notification, NotificationChannel, NotificationKind, WimiError, WimiResult};

/// Writes notifications to the log. The default when no transport is set.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationChannel for TracingNotifier {
    async fn send(&self, notification: Notification) -> WimiResult<()> {
        match notification.kind {
            NotificationKind::Escalation => warn!(
                plan_id = %notification.plan_id,
                "Escalation: {}", notification.message
            ),
            kind => info!(
                plan_id = %notification.plan_id,
                kind = ?kind,
                "{}", notification.message
            ),
        }
        Ok(())
    }
}

/// Fans notifications out to any number of subscribers, e.g. web-socket
/// sessions waiting on an approval.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    /// Channel buffering up to `capacity` undelivered notifications.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every later notification.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl NotificationChannel for BroadcastNotifier {
    async fn send(&self, notification: Notification) -> WimiResult<()> {
        self.tx
            .send(notification)
            .map(|_| ())
            .map_err(|_| WimiError::Network("no notification subscribers".into()))
    }
}

/// Keeps every notification in memory. Used by the CLI to print what a
/// reviewer would have received.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every notification so far, oldest first.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Notifications of one kind, oldest first.
    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationChannel for CollectingNotifier {
    async fn send(&self, notification: Notification) -> WimiResult<()> {
        self.sent.lock().push(notification);
        Ok(())
    }
}
