use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use swarmrouter_core::{Alert, AuditEvent, sha256_hex};

use super::{AnchorConfig, AnchorError, AnchorResult, StorageRef, TxRef};
use crate::alerting::Alerter;
use crate::content::{ContentStore, local_content_id};
use crate::governance::{GovernanceSink, SinkError, TimelineRecord};
use crate::ledger::{ConfirmationStatus, Ledger, LedgerError};
use crate::retry::{retry_if, with_retry};

/// Hashes, pins, notifies, anchors on-chain and records a governance event.
#[derive(Clone)]
pub struct AuditAnchor {
    content: Option<Arc<dyn ContentStore>>,
    governance: Arc<dyn GovernanceSink>,
    ledger: Arc<dyn Ledger>,
    alerter: Alerter,
    config: AnchorConfig,
}

impl AuditAnchor {
    pub fn new(
        content: Option<Arc<dyn ContentStore>>,
        governance: Arc<dyn GovernanceSink>,
        ledger: Arc<dyn Ledger>,
        alerter: Alerter,
        config: AnchorConfig,
    ) -> Self {
        Self {
            content,
            governance,
            ledger,
            alerter,
            config,
        }
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn anchor(&self, event: &AuditEvent) -> Result<AnchorResult, AnchorError> {
        let canonical = event.canonical_json();
        let audit_hash = sha256_hex(canonical.as_bytes());
        info!(%audit_hash, "anchoring audit event");

        let storage_ref = self.pin(canonical.as_bytes()).await?;

        let governance_notified = match self.governance.notify(event, storage_ref.as_str()).await {
            Ok(()) => true,
            Err(SinkError::NotConfigured) => false,
            Err(err) => {
                warn!(%audit_hash, error = %err, "governance notification failed");
                false
            }
        };

        let tx_ref = self.anchor_on_chain(&audit_hash).await;

        let record = TimelineRecord {
            audit_hash: audit_hash.clone(),
            storage_ref: storage_ref.to_string(),
            tx_ref: tx_ref.to_string(),
            governance_notified,
            source_event: event.clone(),
        };
        let timeline_persisted = self.persist_timeline(&record).await;

        Ok(AnchorResult {
            audit_hash,
            storage_ref,
            tx_ref,
            governance_notified,
            timeline_persisted,
        })
    }

    async fn pin(&self, bytes: &[u8]) -> Result<StorageRef, AnchorError> {
        let Some(content) = &self.content else {
            let local = local_content_id(bytes);
            warn!(storage_ref = %local, "no content store configured, using local digest id");
            return Ok(StorageRef::LocalDigest(local));
        };

        with_retry(&self.config.pin, "content_pin", |_| content.pin(bytes))
            .await
            .map(StorageRef::Pinned)
            .map_err(|source| AnchorError::PinningFailed {
                attempts: self.config.pin.attempts(),
                source,
            })
    }

    async fn anchor_on_chain(&self, audit_hash: &str) -> TxRef {
        let outcome = with_retry(&self.config.chain, "chain_anchor", |_| {
            self.submit_and_confirm(audit_hash)
        })
        .await;

        match outcome {
            Ok(signature) => {
                info!(%audit_hash, %signature, "audit hash anchored on-chain");
                TxRef::Confirmed(signature)
            }
            Err(err) => {
                let fallback = format!(
                    "mock_tx_{}",
                    sha256_hex(format!("{audit_hash}|{}", Utc::now().timestamp_millis()).as_bytes())
                );
                self.alerter
                    .dispatch(
                        Alert::critical(
                            "On-chain audit anchoring failed",
                            format!(
                                "audit_hash {audit_hash} could not be anchored after {} attempts ({err}); fallback reference {fallback}",
                                self.config.chain.attempts()
                            ),
                        )
                        .with_tags(["audit", "anchor"]),
                    )
                    .await;
                TxRef::Fallback(fallback)
            }
        }
    }

    async fn submit_and_confirm(&self, audit_hash: &str) -> Result<String, LedgerError> {
        let signature = self.ledger.submit_memo(audit_hash.as_bytes()).await?;
        let deadline = tokio::time::Instant::now() + self.config.confirm_timeout;

        loop {
            match self.ledger.confirmation_status(&signature).await {
                Ok(ConfirmationStatus::Confirmed) => return Ok(signature),
                Ok(ConfirmationStatus::Failed) => {
                    return Err(LedgerError::Rejected(format!("memo {signature} failed on-chain")));
                }
                Ok(ConfirmationStatus::Pending) => {}
                // Transient status read failures keep polling until the deadline.
                Err(err) => warn!(%signature, error = %err, "confirmation poll failed"),
            }

            if tokio::time::Instant::now() + self.config.confirm_poll > deadline {
                return Err(LedgerError::Timeout);
            }
            tokio::time::sleep(self.config.confirm_poll).await;
        }
    }

    async fn persist_timeline(&self, record: &TimelineRecord) -> bool {
        let outcome = retry_if(
            &self.config.timeline,
            "timeline_persist",
            |_| self.governance.record_timeline(record),
            |err| *err != SinkError::NotConfigured,
        )
        .await;

        match outcome {
            Ok(()) => true,
            Err(SinkError::NotConfigured) => {
                warn!(audit_hash = %record.audit_hash, "governance logger not configured, timeline skipped");
                false
            }
            Err(err) => {
                warn!(audit_hash = %record.audit_hash, error = %err, "timeline persistence failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use swarmrouter_core::{JobId, RetryPolicy};

    use crate::alerting::InMemoryAlertSink;
    use crate::content::InMemoryContentStore;
    use crate::governance::InMemoryGovernanceSink;
    use crate::ledger::InMemoryLedger;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn fast_config() -> AnchorConfig {
        AnchorConfig {
            pin: fast(3),
            chain: fast(2),
            confirm_timeout: Duration::from_millis(20),
            confirm_poll: Duration::from_millis(2),
            timeline: fast(3),
        }
    }

    struct Harness {
        content: Arc<InMemoryContentStore>,
        governance: Arc<InMemoryGovernanceSink>,
        ledger: Arc<InMemoryLedger>,
        alerts: Arc<InMemoryAlertSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                content: Arc::new(InMemoryContentStore::new()),
                governance: Arc::new(InMemoryGovernanceSink::new()),
                ledger: InMemoryLedger::arc(),
                alerts: Arc::new(InMemoryAlertSink::new()),
            }
        }

        fn anchor(&self, with_content: bool) -> AuditAnchor {
            let content: Option<Arc<dyn ContentStore>> = if with_content {
                Some(self.content.clone())
            } else {
                None
            };
            AuditAnchor::new(
                content,
                self.governance.clone(),
                self.ledger.clone(),
                Alerter::new(Some(self.alerts.clone())),
                fast_config(),
            )
        }
    }

    fn event() -> AuditEvent {
        AuditEvent::new("unsigned_refunds", Utc::now())
            .with_jobs([JobId::new()])
            .with_details("refunds without signature")
            .with_metadata(json!({"count": 1}))
    }

    #[tokio::test]
    async fn happy_path_produces_complete_result() {
        let h = Harness::new();
        let event = event();

        let result = h.anchor(true).anchor(&event).await.unwrap();

        assert!(result.is_complete());
        assert_eq!(result.audit_hash, event.audit_hash());
        assert!(result.governance_notified);
        assert!(result.timeline_persisted);
        assert_eq!(h.ledger.memos(), vec![result.audit_hash.as_bytes().to_vec()]);

        let timeline = h.governance.timeline();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].storage_ref, result.storage_ref.as_str());
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn unreachable_storage_is_a_typed_pinning_failure() {
        let h = Harness::new();
        h.content.set_failing(true);

        let err = h.anchor(true).anchor(&event()).await.unwrap_err();

        assert!(matches!(err, AnchorError::PinningFailed { attempts: 3, .. }));
        assert_eq!(h.content.attempts(), 3);
        assert!(h.ledger.memos().is_empty());
    }

    #[tokio::test]
    async fn missing_content_store_falls_back_to_local_digest() {
        let h = Harness::new();
        let event = event();

        let result = h.anchor(false).anchor(&event).await.unwrap();

        assert_eq!(
            result.storage_ref,
            StorageRef::LocalDigest(local_content_id(event.canonical_json().as_bytes()))
        );
        assert!(result.is_degraded());
    }

    #[tokio::test]
    async fn notification_failure_only_clears_the_flag() {
        let h = Harness::new();
        h.governance.set_notify_fails(true);

        let result = h.anchor(true).anchor(&event()).await.unwrap();

        assert!(!result.governance_notified);
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn chain_exhaustion_returns_fallback_and_alerts() {
        let h = Harness::new();
        h.ledger.set_default_status(ConfirmationStatus::Pending);

        let result = h.anchor(true).anchor(&event()).await.unwrap();

        assert!(matches!(&result.tx_ref, TxRef::Fallback(sig) if sig.starts_with("mock_tx_")));
        assert_eq!(h.ledger.memos().len(), 2);
        assert_eq!(h.alerts.count_titled("On-chain audit anchoring failed"), 1);
    }

    #[tokio::test]
    async fn timeline_write_is_retried() {
        let h = Harness::new();
        h.governance.fail_next_timeline_writes(2);

        let result = h.anchor(true).anchor(&event()).await.unwrap();

        assert!(result.timeline_persisted);
        assert_eq!(h.governance.timeline_attempts(), 3);
    }

    #[tokio::test]
    async fn same_event_hashes_identically_across_anchors() {
        let h = Harness::new();
        let anchor = h.anchor(true);
        let event = event();

        let a = anchor.anchor(&event).await.unwrap();
        let b = anchor.anchor(&event).await.unwrap();
        assert_eq!(a.audit_hash, b.audit_hash);
    }
}
