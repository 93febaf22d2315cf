//! Validator health probing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::http::{HttpError, join_url};

/// What a single health probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeReport {
    pub latency_ms: u64,
    /// Only present when the node reported it.
    pub capacity_used: Option<u32>,
    pub max_capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("probe failed: {0}")]
    Unreachable(String),
}

impl From<HttpError> for ProbeError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Timeout => ProbeError::Timeout,
            other => ProbeError::Unreachable(other.to_string()),
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> Result<ProbeReport, ProbeError>;
}

#[async_trait]
impl<P: HealthProbe + ?Sized> HealthProbe for Arc<P> {
    async fn probe(&self, endpoint: &str) -> Result<ProbeReport, ProbeError> {
        (**self).probe(endpoint).await
    }
}

/// GETs `{endpoint}/health` under a short timeout.
///
/// A non-2xx answer still counts as reachable: latency is measured, capacity
/// is left unreported.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &str) -> Result<ProbeReport, ProbeError> {
        let started = Instant::now();
        let resp = self
            .client
            .get(join_url(endpoint, "/health"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(HttpError::from)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !resp.status().is_success() {
            debug!(endpoint, status = resp.status().as_u16(), "health endpoint returned non-success");
            return Ok(ProbeReport {
                latency_ms,
                ..ProbeReport::default()
            });
        }

        let body: Option<JsonValue> = resp.json().await.ok();
        Ok(report_from_body(latency_ms, body.as_ref()))
    }
}

fn report_from_body(latency_ms: u64, body: Option<&JsonValue>) -> ProbeReport {
    let read = |key: &str| {
        body.and_then(|b| b.get(key))
            .and_then(JsonValue::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    };
    ProbeReport {
        latency_ms,
        capacity_used: read("capacity_used"),
        max_capacity: read("max_capacity"),
    }
}

/// Canned probe results keyed by endpoint, for tests/dev.
///
/// Unknown endpoints are unreachable.
#[derive(Debug, Default)]
pub struct StaticHealthProbe {
    results: Mutex<HashMap<String, Result<ProbeReport, ProbeError>>>,
}

impl StaticHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, endpoint: impl Into<String>, result: Result<ProbeReport, ProbeError>) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.into(), result);
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn probe(&self, endpoint: &str) -> Result<ProbeReport, ProbeError> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| Err(ProbeError::Unreachable(format!("no route to {endpoint}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_numeric_capacity_fields_only() {
        let body = json!({"capacity_used": 3, "max_capacity": "ten"});
        let report = report_from_body(42, Some(&body));
        assert_eq!(report.latency_ms, 42);
        assert_eq!(report.capacity_used, Some(3));
        assert_eq!(report.max_capacity, None);

        assert_eq!(report_from_body(7, None).capacity_used, None);
    }

    #[tokio::test]
    async fn static_probe_treats_unknown_endpoints_as_unreachable() {
        let probe = StaticHealthProbe::new();
        probe.set("http://v1", Ok(ProbeReport { latency_ms: 10, ..Default::default() }));

        assert_eq!(probe.probe("http://v1").await.unwrap().latency_ms, 10);
        assert!(matches!(probe.probe("http://v2").await, Err(ProbeError::Unreachable(_))));
    }
}
