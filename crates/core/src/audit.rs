//! Governance audit events and their deterministic digest.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::id::JobId;

/// A governance-relevant fact to be anchored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    #[serde(with = "rfc3339_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggering_job_ids: Vec<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub metadata: JsonValue,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp,
            triggering_job_ids: Vec::new(),
            details: None,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_jobs(mut self, jobs: impl IntoIterator<Item = JobId>) -> Self {
        self.triggering_job_ids = jobs.into_iter().collect();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Byte-stable serialization of the event.
    pub fn canonical_json(&self) -> String {
        // Serializing a plain struct into a Value cannot fail.
        let value = serde_json::to_value(self).unwrap_or(JsonValue::Null);
        canonical_json(&value)
    }

    /// Hex SHA-256 of [`AuditEvent::canonical_json`]; the anchor's identity.
    pub fn audit_hash(&self) -> String {
        sha256_hex(self.canonical_json().as_bytes())
    }
}

/// Recursively sort object keys and serialize without whitespace.
///
/// Sorting is done here rather than relying on `serde_json::Map` ordering,
/// which changes when the `preserve_order` feature is enabled anywhere in the
/// dependency graph.
pub fn canonical_json(value: &JsonValue) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), sort_keys(v));
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

mod rfc3339_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
