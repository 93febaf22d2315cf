use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use swarmrouter_core::ValidatorUpdate;

use super::PeriodicTask;
use crate::ledger::{Ledger, LedgerError, OnChainValidator};
use crate::probe::HealthProbe;
use crate::registry::ValidatorRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSyncConfig {
    pub interval: Duration,
    /// `{id}` is replaced by the validator id.
    pub endpoint_template: String,
    /// Per-validator health endpoints, keyed by validator id.
    pub endpoint_overrides: HashMap<String, String>,
    /// Latency recorded for a validator whose probe failed.
    pub degraded_latency_ms: u64,
    /// Values assumed when a validator has no endpoint to probe.
    pub default_latency_ms: u64,
    pub default_max_capacity: u32,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            endpoint_template: "https://{id}.neuroswarm.io".to_string(),
            endpoint_overrides: HashMap::new(),
            degraded_latency_ms: 2_000,
            default_latency_ms: 500,
            default_max_capacity: 8,
        }
    }
}

/// Merges on-chain validator metadata with live health probes into the registry.
#[derive(Clone)]
pub struct StateSync {
    ledger: Arc<dyn Ledger>,
    probe: Arc<dyn HealthProbe>,
    registry: Arc<ValidatorRegistry>,
    config: StateSyncConfig,
}

impl StateSync {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        probe: Arc<dyn HealthProbe>,
        registry: Arc<ValidatorRegistry>,
        config: StateSyncConfig,
    ) -> Self {
        Self {
            ledger,
            probe,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &StateSyncConfig {
        &self.config
    }

    /// One sync pass. Returns how many validators were applied.
    ///
    /// A failed metadata fetch leaves the registry untouched.
    pub async fn sync_once(&self) -> Result<usize, LedgerError> {
        let onchain = self.ledger.validators().await?;

        let mut probes = JoinSet::new();
        for validator in onchain {
            let probe = self.probe.clone();
            let config = self.config.clone();
            probes.spawn(async move { probe_validator(probe.as_ref(), &config, validator).await });
        }

        let mut updates = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(update) => updates.push(update),
                Err(err) => error!(error = %err, "validator probe task failed"),
            }
        }

        let applied = updates.len();
        self.registry.apply_batch(updates, Utc::now());
        info!(synced = applied, registry_size = self.registry.len(), "validator state synced");
        Ok(applied)
    }
}

#[async_trait]
impl PeriodicTask for StateSync {
    fn name(&self) -> &'static str {
        "state_sync"
    }

    async fn tick(&self) {
        if let Err(err) = self.sync_once().await {
            warn!(error = %err, "validator sync skipped, on-chain metadata unavailable");
        }
    }
}

async fn probe_validator(
    probe: &dyn HealthProbe,
    config: &StateSyncConfig,
    validator: OnChainValidator,
) -> ValidatorUpdate {
    let id = validator.id.clone();
    let target = config
        .endpoint_overrides
        .get(id.as_str())
        .cloned()
        .or_else(|| validator.endpoint.clone().filter(|e| !e.is_empty()));

    let mut latency_ms = config.default_latency_ms;
    let mut capacity_used = 0;
    let mut max_capacity = config.default_max_capacity;

    if let Some(endpoint) = &target {
        match probe.probe(endpoint).await {
            Ok(report) => {
                latency_ms = report.latency_ms;
                capacity_used = report.capacity_used.unwrap_or(capacity_used);
                max_capacity = report.max_capacity.unwrap_or(max_capacity);
            }
            Err(err) => {
                warn!(validator_id = %id, %endpoint, error = %err, "health probe failed, marking degraded");
                latency_ms = config.degraded_latency_ms;
            }
        }
    }

    let endpoint = target.unwrap_or_else(|| config.endpoint_template.replace("{id}", id.as_str()));
    ValidatorUpdate {
        endpoint: Some(endpoint),
        latency_ms: Some(latency_ms),
        capacity_used: Some(capacity_used),
        max_capacity: Some(max_capacity),
        ..validator.into_update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmrouter_core::ValidatorId;

    use crate::ledger::InMemoryLedger;
    use crate::probe::{ProbeError, ProbeReport, StaticHealthProbe};

    fn onchain(id: &str, endpoint: Option<&str>) -> OnChainValidator {
        OnChainValidator {
            id: ValidatorId::new(id).unwrap(),
            wallet_address: format!("{id}_wallet"),
            stake: 5_000,
            reputation: 90,
            endpoint: endpoint.map(str::to_string),
        }
    }

    fn setup() -> (Arc<InMemoryLedger>, Arc<StaticHealthProbe>, Arc<ValidatorRegistry>) {
        (
            InMemoryLedger::arc(),
            Arc::new(StaticHealthProbe::new()),
            Arc::new(ValidatorRegistry::new()),
        )
    }

    #[tokio::test]
    async fn probe_results_and_failures_are_merged_per_validator() {
        let (ledger, probe, registry) = setup();
        ledger.set_validators(vec![
            onchain("healthy", Some("http://healthy")),
            onchain("down", Some("http://down")),
            onchain("silent", None),
        ]);
        probe.set(
            "http://healthy",
            Ok(ProbeReport {
                latency_ms: 35,
                capacity_used: Some(2),
                max_capacity: Some(4),
            }),
        );
        probe.set("http://down", Err(ProbeError::Timeout));

        let sync = StateSync::new(ledger, probe, registry.clone(), StateSyncConfig::default());
        assert_eq!(sync.sync_once().await.unwrap(), 3);

        let get = |id: &str| registry.get_by_id(&ValidatorId::new(id).unwrap()).unwrap();

        let healthy = get("healthy");
        assert_eq!((healthy.latency_ms, healthy.capacity_used, healthy.max_capacity), (35, 2, 4));
        assert_eq!(healthy.stake, 5_000);
        assert_eq!(healthy.wallet_address, "healthy_wallet");

        let down = get("down");
        assert_eq!(down.latency_ms, 2_000);
        assert_eq!(down.endpoint, "http://down");

        let silent = get("silent");
        assert_eq!(silent.latency_ms, 500);
        assert_eq!(silent.max_capacity, 8);
        assert_eq!(silent.endpoint, "https://silent.neuroswarm.io");
    }

    #[tokio::test]
    async fn endpoint_override_wins_over_onchain_endpoint() {
        let (ledger, probe, registry) = setup();
        ledger.set_validators(vec![onchain("v1", Some("http://chain"))]);
        probe.set("http://override", Ok(ProbeReport { latency_ms: 12, ..Default::default() }));

        let config = StateSyncConfig {
            endpoint_overrides: HashMap::from([("v1".to_string(), "http://override".to_string())]),
            ..StateSyncConfig::default()
        };
        StateSync::new(ledger, probe, registry.clone(), config).sync_once().await.unwrap();

        let v1 = registry.get_by_id(&ValidatorId::new("v1").unwrap()).unwrap();
        assert_eq!(v1.endpoint, "http://override");
        assert_eq!(v1.latency_ms, 12);
    }

    #[tokio::test]
    async fn failed_metadata_fetch_keeps_registry() {
        let (ledger, probe, registry) = setup();
        registry.upsert(ValidatorUpdate::for_id(ValidatorId::new("seed").unwrap()), Utc::now());
        ledger.set_validators_fail(true);

        let sync = StateSync::new(ledger, probe, registry.clone(), StateSyncConfig::default());
        assert!(sync.sync_once().await.is_err());
        sync.tick().await;
        assert_eq!(registry.len(), 1);
    }
}
