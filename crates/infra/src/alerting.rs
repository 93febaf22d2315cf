//! Operational alerting with a local-log fallback.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, warn};

use swarmrouter_core::{Alert, AlertPriority};

use crate::governance::SinkError;
use crate::http::send;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn post(&self, alert: &Alert) -> Result<(), SinkError>;
}

/// Slack incoming-webhook sink.
#[derive(Debug, Clone)]
pub struct SlackWebhookSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackWebhookSink {
    pub fn new(client: reqwest::Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for SlackWebhookSink {
    async fn post(&self, alert: &Alert) -> Result<(), SinkError> {
        let body = json!({ "text": alert.to_chat_text() });
        send(self.client.post(&self.webhook_url).json(&body)).await?;
        Ok(())
    }
}

/// In-memory alert sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
    failing: AtomicBool,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count_titled(&self, title: &str) -> usize {
        self.alerts().iter().filter(|a| a.title == title).count()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn post(&self, alert: &Alert) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Delivery("sink down".to_string()));
        }
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(())
    }
}

/// Fan-out of alerts. Never fails: the local log is always written, the
/// external sink is best-effort.
#[derive(Clone, Default)]
pub struct Alerter {
    sink: Option<Arc<dyn AlertSink>>,
}

impl std::fmt::Debug for Alerter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alerter")
            .field("sink_configured", &self.sink.is_some())
            .finish()
    }
}

impl Alerter {
    pub fn new(sink: Option<Arc<dyn AlertSink>>) -> Self {
        Self { sink }
    }

    /// Local log only.
    pub fn log_only() -> Self {
        Self { sink: None }
    }

    pub async fn dispatch(&self, alert: Alert) {
        let tags = alert.tags.join(",");
        match alert.priority {
            AlertPriority::Critical | AlertPriority::High => error!(
                priority = %alert.priority,
                title = %alert.title,
                details = %alert.details,
                tags = %tags,
                "alert"
            ),
            AlertPriority::Medium | AlertPriority::Low => warn!(
                priority = %alert.priority,
                title = %alert.title,
                details = %alert.details,
                tags = %tags,
                "alert"
            ),
        }

        if let Some(sink) = &self.sink {
            if let Err(err) = sink.post(&alert).await {
                warn!(title = %alert.title, error = %err, "alert sink delivery failed");
            }
        }
    }
}
