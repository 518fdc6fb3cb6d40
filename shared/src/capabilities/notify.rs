use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Lets the platform collapse repeated notifications.
    #[serde(default)]
    pub tag: Option<String>,
}

pub const NOTIFICATION_TAG: &str = "signalhub-alert";

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            tag: Some(NOTIFICATION_TAG.to_string()),
        }
    }

    pub fn connection_lost() -> Self {
        Self::new(
            "Connection Lost",
            "Switching to offline mode. Changes will be saved locally.",
        )
    }

    pub fn connection_restored() -> Self {
        Self::new(
            "Connection Restored",
            "Offline changes have been synced to the cloud.",
        )
    }

    pub fn sync_failed(endpoint: &str, attempts: u32) -> Self {
        Self::new(
            "Sync Failed",
            format!(
                "A change to {endpoint} could not be synced after {attempts} attempts. Review it in pending changes."
            ),
        )
    }
}

/// Platform notification delivery. Calls must not block and cannot fail.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);

    fn dispatch(&self, notification: &Notification) {
        self.notify(&notification.title, &notification.body);
    }
}

/// Logs notifications; the default when the host has no delivery mechanism.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!(title, body, "notification");
    }
}

/// Forwards notifications to the host shell over a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, title: &str, body: &str) {
        self.dispatch(&Notification::new(title, body));
    }

    fn dispatch(&self, notification: &Notification) {
        if self.tx.send(notification.clone()).is_err() {
            debug!(title = %notification.title, "notification receiver dropped");
        }
    }
}

/// Keeps every notification in memory, for hosts that poll.
#[derive(Debug, Default)]
pub struct BufferedNotifier {
    delivered: Mutex<Vec<Notification>>,
}

impl BufferedNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Notification> {
        match self.delivered.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl Notifier for BufferedNotifier {
    fn notify(&self, title: &str, body: &str) {
        let notification = Notification::new(title, body);
        match self.delivered.lock() {
            Ok(mut guard) => guard.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}
