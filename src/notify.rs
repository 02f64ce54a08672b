//! Job outcome notifications.
//!
//! Mail delivery itself is external; the engine only renders the subject
//! and body from [`MailConfig`] and hands them to a [`Notifier`].

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::config::MailConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: Notification) -> Result<()> {
        info!(to = %notification.to, subject = %notification.subject, "Notification");
        Ok(())
    }
}

/// Keeps every notification, for inspection in tests.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: Notification) -> Result<()> {
        self.sent.lock().push(notification);
        Ok(())
    }
}

fn render(template: &str, persistent_id: &str, url: &str, error: &str) -> String {
    template
        .replace("{pid}", persistent_id)
        .replace("{url}", url)
        .replace("{error}", error)
}

#[must_use]
pub fn success_notification(mail: &MailConfig, to: &str, persistent_id: &str, url: &str) -> Notification {
    Notification {
        to: to.to_string(),
        subject: render(&mail.success_subject, persistent_id, url, ""),
        body: render(&mail.success_template, persistent_id, url, ""),
    }
}

#[must_use]
pub fn failure_notification(
    mail: &MailConfig,
    to: &str,
    persistent_id: &str,
    url: &str,
    error: &str,
) -> Notification {
    Notification {
        to: to.to_string(),
        subject: render(&mail.failure_subject, persistent_id, url, error),
        body: render(&mail.failure_template, persistent_id, url, error),
    }
}
