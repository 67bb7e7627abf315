//! Human-readable status notifications
//!
//! A [`Notifier`] fans leveled messages out to every configured
//! [`NotificationService`]. With no services it does nothing, and messages
//! below the configured minimum level are dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::DeployConfig;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP notification failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification channel closed")]
    ChannelClosed,
}

/// Notification severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum NotificationLevel {
    Info,
    #[default]
    Success,
    Warning,
    Failure,
}

impl From<String> for NotificationLevel {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "INFO" => NotificationLevel::Info,
            "WARNING" => NotificationLevel::Warning,
            "FAILURE" => NotificationLevel::Failure,
            _ => NotificationLevel::Success,
        }
    }
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Success => "success",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub level: NotificationLevel,
    pub title: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A destination notifications are delivered to.
#[async_trait]
pub trait NotificationService: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// POSTs each notification as JSON to a fixed URL.
pub struct WebhookService {
    client: reqwest::Client,
    url: String,
}

impl WebhookService {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationService for WebhookService {
    fn name(&self) -> &str {
        &self.url
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Publishes notifications to in-process subscribers (the SSE stream).
pub struct BroadcastService {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastService {
    pub fn new(sender: broadcast::Sender<Notification>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl NotificationService for BroadcastService {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        // No subscribers is not an error, there is just nobody listening
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(notification.clone())
            .map(|_| ())
            .map_err(|_| NotifyError::ChannelClosed)
    }
}

#[derive(Clone, Default)]
pub struct Notifier {
    min_level: NotificationLevel,
    services: Vec<Arc<dyn NotificationService>>,
}

impl Notifier {
    pub fn new(min_level: NotificationLevel) -> Self {
        Self {
            min_level,
            services: Vec::new(),
        }
    }

    /// Builds a notifier with one [`WebhookService`] per configured target.
    pub fn from_config(config: &DeployConfig) -> Result<Self, NotifyError> {
        let mut notifier = Self::new(config.notification_level);
        for target in &config.notifications {
            notifier = notifier.with_service(Arc::new(WebhookService::new(&target.url)?));
        }
        debug!(
            "Loaded {} notification service(s).",
            notifier.service_count()
        );
        Ok(notifier)
    }

    pub fn with_service(mut self, service: Arc<dyn NotificationService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub async fn notify(
        &self,
        level: NotificationLevel,
        title: impl Into<String>,
        body: impl Into<String>,
    ) {
        if self.services.is_empty() || level < self.min_level {
            return;
        }

        let notification = Notification::new(level, title, body);
        for service in &self.services {
            if let Err(e) = service.send(&notification).await {
                warn!(
                    "Failed to deliver {} notification via {}: {}",
                    level.as_str(),
                    service.name(),
                    e
                );
            }
        }
    }

    pub async fn info(&self, body: impl Into<String>) {
        self.notify(NotificationLevel::Info, "Info", body).await
    }

    pub async fn success(&self, body: impl Into<String>) {
        self.notify(NotificationLevel::Success, "Success", body).await
    }

    pub async fn warning(&self, body: impl Into<String>) {
        self.notify(NotificationLevel::Warning, "Warning", body).await
    }

    pub async fn failure(&self, body: impl Into<String>) {
        self.notify(NotificationLevel::Failure, "Failure", body).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every notification it receives.
    #[derive(Default)]
    pub struct RecordingService {
        received: Mutex<Vec<Notification>>,
    }

    impl RecordingService {
        pub fn received(&self) -> Vec<Notification> {
            self.received.lock().unwrap().clone()
        }

        pub fn levels(&self) -> Vec<NotificationLevel> {
            self.received().iter().map(|n| n.level).collect()
        }
    }

    #[async_trait]
    impl NotificationService for RecordingService {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.received.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    /// Always fails to deliver.
    pub struct FailingService;

    #[async_trait]
    impl NotificationService for FailingService {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::ChannelClosed)
        }
    }
}
