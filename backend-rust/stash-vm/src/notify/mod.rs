//! Notification delivery.
//!
//! Operations that grant visibility write a notification row inside their own
//! transaction. Once that transaction commits, the store hands every new row to
//! a `Notifier`. Delivery is best-effort: a failure is logged by the store and
//! never undoes the action that produced the notification.

use reqwest::Client;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::models::Notification;

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug)]
pub enum NotifyError {
    ChannelClosed,
    Delivery(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::ChannelClosed => write!(f, "Notification channel closed"),
            NotifyError::Delivery(msg) => write!(f, "Delivery error: {}", msg),
        }
    }
}

impl std::error::Error for NotifyError {}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> NotifyResult<()>;
}

/// Writes each notification to the log. Used when no delivery channel is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> NotifyResult<()> {
        log::info!(
            "Notification {} ({}) for user {}",
            notification.id,
            notification.content.content_type(),
            notification.recipient_id
        );
        Ok(())
    }
}

/// Forwards notifications to an HTTP endpoint from a background task.
///
/// `notify` only enqueues, so it never blocks the caller on the network.
pub struct WebhookNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl WebhookNotifier {
    /// Spawn the delivery task. Must be called from inside a tokio runtime.
    pub fn spawn(url: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                match client.post(&url).json(&notification).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        log::debug!("Delivered notification {}", notification.id);
                    }
                    Ok(resp) => {
                        log::warn!(
                            "Webhook rejected notification {}: HTTP {}",
                            notification.id,
                            resp.status()
                        );
                    }
                    Err(e) => {
                        log::warn!("Failed to deliver notification {}: {}", notification.id, e);
                    }
                }
            }
            log::info!("Webhook notifier stopped");
        });

        Self { tx }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: &Notification) -> NotifyResult<()> {
        self.tx
            .send(notification.clone())
            .map_err(|_| NotifyError::ChannelClosed)
    }
}

/// Keeps every notification it is handed. Useful for inspecting what an action emitted.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, recipient_id: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.recipient_id == recipient_id)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> NotifyResult<()> {
        self.sent
            .lock()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?
            .push(notification.clone());
        Ok(())
    }
}
