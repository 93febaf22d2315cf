//! Ledger write events awaiting (or done with) audit anchoring.

pub mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use swarmrouter_core::{AuditEvent, DomainError, LedgerEntryId, canonical_json, sha256_hex};

pub use postgres::PostgresLedgerEventLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    Audit,
    Transaction,
    JobCompletion,
}

impl LedgerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventKind::Audit => "audit",
            LedgerEventKind::Transaction => "transaction",
            LedgerEventKind::JobCompletion => "job_completion",
        }
    }
}

impl core::fmt::Display for LedgerEventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for LedgerEventKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Audit, Self::Transaction, Self::JobCompletion]
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown ledger event kind: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub kind: LedgerEventKind,
    pub payload: JsonValue,
    /// Digest of the canonical payload.
    pub payload_hash: String,
    pub storage_ref: Option<String>,
    pub tx_ref: Option<String>,
    pub anchored: bool,
    pub created_at: DateTime<Utc>,
    pub anchored_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn new(kind: LedgerEventKind, payload: JsonValue, now: DateTime<Utc>) -> Self {
        let payload_hash = sha256_hex(canonical_json(&payload).as_bytes());
        Self {
            id: LedgerEntryId::new(),
            kind,
            payload,
            payload_hash,
            storage_ref: None,
            tx_ref: None,
            anchored: false,
            created_at: now,
            anchored_at: None,
        }
    }

    /// The audit event this entry is anchored as.
    pub fn to_audit_event(&self) -> AuditEvent {
        AuditEvent::new(format!("ledger_{}", self.kind), self.created_at).with_metadata(json!({
            "entry_id": self.id,
            "payload": self.payload,
            "payload_hash": self.payload_hash,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerEventError {
    #[error("ledger entry not found: {0}")]
    NotFound(LedgerEntryId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait LedgerEventLog: Send + Sync {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerEventError>;

    async fn mark_anchored(
        &self,
        id: LedgerEntryId,
        storage_ref: &str,
        tx_ref: &str,
    ) -> Result<LedgerEntry, LedgerEventError>;

    async fn get(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerEventError>;

    /// Oldest first.
    async fn unanchored(&self) -> Result<Vec<LedgerEntry>, LedgerEventError>;
}

#[async_trait]
impl<L: LedgerEventLog + ?Sized> LedgerEventLog for Arc<L> {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerEventError> {
        (**self).append(entry).await
    }

    async fn mark_anchored(
        &self,
        id: LedgerEntryId,
        storage_ref: &str,
        tx_ref: &str,
    ) -> Result<LedgerEntry, LedgerEventError> {
        (**self).mark_anchored(id, storage_ref, tx_ref).await
    }

    async fn get(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerEventError> {
        (**self).get(id).await
    }

    async fn unanchored(&self) -> Result<Vec<LedgerEntry>, LedgerEventError> {
        (**self).unanchored().await
    }
}

/// In-memory ledger event log for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLedgerEventLog {
    entries: Mutex<HashMap<LedgerEntryId, LedgerEntry>>,
}

impl InMemoryLedgerEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<LedgerEntryId, LedgerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LedgerEventLog for InMemoryLedgerEventLog {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerEventError> {
        self.lock().insert(entry.id, entry.clone());
        Ok(())
    }

    async fn mark_anchored(
        &self,
        id: LedgerEntryId,
        storage_ref: &str,
        tx_ref: &str,
    ) -> Result<LedgerEntry, LedgerEventError> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(LedgerEventError::NotFound(id))?;
        entry.storage_ref = Some(storage_ref.to_string());
        entry.tx_ref = Some(tx_ref.to_string());
        entry.anchored = true;
        entry.anchored_at = Some(Utc::now());
        Ok(entry.clone())
    }

    async fn get(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerEventError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn unanchored(&self) -> Result<Vec<LedgerEntry>, LedgerEventError> {
        let mut out: Vec<LedgerEntry> = self.lock().values().filter(|e| !e.anchored).cloned().collect();
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }
}
