//! Governance sink capability: audit notifications and the public timeline.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use swarmrouter_core::AuditEvent;

use crate::http::{HttpError, send};

/// Delivery failure of a best-effort outbound sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// No endpoint configured; callers skip rather than retry.
    #[error("sink not configured")]
    NotConfigured,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl From<HttpError> for SinkError {
    fn from(err: HttpError) -> Self {
        SinkError::Delivery(err.to_string())
    }
}

/// What gets written to the governance timeline once an event is anchored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineRecord {
    pub audit_hash: String,
    pub storage_ref: String,
    pub tx_ref: String,
    pub governance_notified: bool,
    pub source_event: AuditEvent,
}

#[async_trait]
pub trait GovernanceSink: Send + Sync {
    async fn notify(&self, event: &AuditEvent, storage_ref: &str) -> Result<(), SinkError>;

    async fn record_timeline(&self, record: &TimelineRecord) -> Result<(), SinkError>;
}

#[async_trait]
impl<G: GovernanceSink + ?Sized> GovernanceSink for Arc<G> {
    async fn notify(&self, event: &AuditEvent, storage_ref: &str) -> Result<(), SinkError> {
        (**self).notify(event, storage_ref).await
    }

    async fn record_timeline(&self, record: &TimelineRecord) -> Result<(), SinkError> {
        (**self).record_timeline(record).await
    }
}

/// Posts an embed-style webhook and timeline entries to the governance logger.
#[derive(Debug, Clone)]
pub struct HttpGovernanceSink {
    client: reqwest::Client,
    webhook_url: Option<String>,
    logger_url: Option<String>,
    service_token: Option<String>,
}

impl HttpGovernanceSink {
    pub fn new(
        client: reqwest::Client,
        webhook_url: Option<String>,
        logger_url: Option<String>,
        service_token: Option<String>,
    ) -> Self {
        Self {
            client,
            webhook_url,
            logger_url,
            service_token,
        }
    }
}

#[async_trait]
impl GovernanceSink for HttpGovernanceSink {
    #[instrument(skip(self, event), fields(event_type = %event.event_type), err)]
    async fn notify(&self, event: &AuditEvent, storage_ref: &str) -> Result<(), SinkError> {
        let url = self.webhook_url.as_deref().ok_or(SinkError::NotConfigured)?;
        send(self.client.post(url).json(&notification_payload(event, storage_ref))).await?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(audit_hash = %record.audit_hash), err)]
    async fn record_timeline(&self, record: &TimelineRecord) -> Result<(), SinkError> {
        let url = self.logger_url.as_deref().ok_or(SinkError::NotConfigured)?;
        let body = json!({
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "action": "timeline_entry_added",
            "actor": "swarmrouter",
            "details": record,
        });

        let mut req = self.client.post(url).json(&body);
        if let Some(token) = &self.service_token {
            req = req.header("x-governance-token", token);
        }
        send(req).await?;
        Ok(())
    }
}

fn notification_payload(event: &AuditEvent, storage_ref: &str) -> serde_json::Value {
    let jobs = if event.triggering_job_ids.is_empty() {
        "N/A".to_string()
    } else {
        event
            .triggering_job_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };

    json!({
        "embeds": [{
            "title": format!("GOVERNANCE AUDIT REQUIRED: {}", event.event_type),
            "description": event.details.clone().unwrap_or_default(),
            "color": 16711680,
            "fields": [
                { "name": "Timestamp (ISO)", "value": event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true), "inline": true },
                { "name": "Content ID", "value": storage_ref, "inline": false },
                { "name": "Jobs Impacted", "value": jobs, "inline": false },
            ],
            "footer": { "text": "Audit anchoring" },
        }]
    })
}

/// In-memory governance sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryGovernanceSink {
    notifications: Mutex<Vec<(AuditEvent, String)>>,
    timeline: Mutex<Vec<TimelineRecord>>,
    notify_fails: AtomicBool,
    timeline_failures: AtomicU32,
    timeline_attempts: AtomicU32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryGovernanceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_notify_fails(&self, fails: bool) {
        self.notify_fails.store(fails, Ordering::SeqCst);
    }

    /// Fail the next `n` timeline writes.
    pub fn fail_next_timeline_writes(&self, n: u32) {
        self.timeline_failures.store(n, Ordering::SeqCst);
    }

    pub fn notifications(&self) -> Vec<(AuditEvent, String)> {
        lock(&self.notifications).clone()
    }

    pub fn timeline(&self) -> Vec<TimelineRecord> {
        lock(&self.timeline).clone()
    }

    pub fn timeline_attempts(&self) -> u32 {
        self.timeline_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GovernanceSink for InMemoryGovernanceSink {
    async fn notify(&self, event: &AuditEvent, storage_ref: &str) -> Result<(), SinkError> {
        if self.notify_fails.load(Ordering::SeqCst) {
            return Err(SinkError::Delivery("webhook down".to_string()));
        }
        lock(&self.notifications).push((event.clone(), storage_ref.to_string()));
        Ok(())
    }

    async fn record_timeline(&self, record: &TimelineRecord) -> Result<(), SinkError> {
        self.timeline_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .timeline_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Delivery("logger down".to_string()));
        }
        lock(&self.timeline).push(record.clone());
        Ok(())
    }
}
