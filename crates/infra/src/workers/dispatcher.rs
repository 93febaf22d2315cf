use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, info};

use swarmrouter_core::{Job, Validator};
use swarmrouter_selection::ValidatorSelector;

use super::PeriodicTask;
use crate::jobs::{JobStore, JobStoreError};
use crate::registry::ValidatorRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub interval: Duration,
    /// Queued jobs picked up per pass.
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 50,
        }
    }
}

/// Assigns queued jobs to validators picked from the registry snapshot.
pub struct QueueDispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<ValidatorRegistry>,
    selector: ValidatorSelector,
    rng: Mutex<StdRng>,
    config: DispatcherConfig,
}

impl QueueDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ValidatorRegistry>,
        selector: ValidatorSelector,
        config: DispatcherConfig,
    ) -> Self {
        Self::with_rng(store, registry, selector, config, StdRng::from_entropy())
    }

    /// Seeded variant for reproducible assignment.
    pub fn with_rng(
        store: Arc<dyn JobStore>,
        registry: Arc<ValidatorRegistry>,
        selector: ValidatorSelector,
        config: DispatcherConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            registry,
            selector,
            rng: Mutex::new(rng),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    /// Pick a validator for `job` from the current snapshot and assign it.
    ///
    /// `Ok(None)` means no validator is eligible; the job stays queued.
    pub async fn try_assign(&self, job: &Job) -> Result<Option<Job>, JobStoreError> {
        let mut candidates = self.registry.get_all();
        self.assign_from(job, &mut candidates).await
    }

    async fn assign_from(
        &self,
        job: &Job,
        candidates: &mut [Validator],
    ) -> Result<Option<Job>, JobStoreError> {
        let chosen = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            self.selector
                .select_best_validator(candidates, Utc::now(), &mut *rng)
                .map(|v| v.id.clone())
        };
        let Some(chosen) = chosen else {
            debug!(job_id = %job.id, "no eligible validator, job stays queued");
            return Ok(None);
        };
        let Some(validator) = candidates.iter_mut().find(|v| v.id == chosen) else {
            return Ok(None);
        };

        let assigned = self
            .store
            .assign_validator(job.id, &validator.id, &validator.endpoint)
            .await?;
        // Later picks in the same pass see the slot as taken.
        validator.capacity_used = validator.capacity_used.saturating_add(1);
        info!(job_id = %job.id, validator_id = %validator.id, "job assigned");
        Ok(Some(assigned))
    }

    /// One pass over dispatchable jobs. Returns how many were assigned.
    pub async fn dispatch_queued(&self) -> Result<usize, JobStoreError> {
        let queued = self.store.get_dispatchable_jobs(self.config.batch_size).await?;
        if queued.is_empty() {
            return Ok(0);
        }

        let mut candidates = self.registry.get_all();
        let mut assigned = 0;
        for job in queued {
            match self.assign_from(&job, &mut candidates).await {
                Ok(Some(_)) => assigned += 1,
                // Nothing eligible for this job means nothing for the rest either.
                Ok(None) => break,
                Err(JobStoreError::StaleTransition(reason)) => {
                    debug!(job_id = %job.id, %reason, "queued job changed concurrently, skipping");
                }
                Err(err) => error!(job_id = %job.id, error = %err, "job assignment failed"),
            }
        }
        Ok(assigned)
    }
}

#[async_trait]
impl PeriodicTask for QueueDispatcher {
    fn name(&self) -> &'static str {
        "queue_dispatcher"
    }

    async fn tick(&self) {
        match self.dispatch_queued().await {
            Ok(0) => {}
            Ok(n) => info!(assigned = n, "dispatched queued jobs"),
            Err(err) => error!(error = %err, "queue dispatch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmrouter_core::{JobStatus, NewJob, ValidatorId, ValidatorUpdate};

    use crate::jobs::InMemoryJobStore;

    fn validator(id: &str, max_capacity: u32) -> ValidatorUpdate {
        ValidatorUpdate {
            endpoint: Some(format!("http://{id}")),
            wallet_address: Some(format!("{id}_wallet")),
            stake: Some(10_000),
            reputation: Some(90),
            latency_ms: Some(100),
            capacity_used: Some(0),
            max_capacity: Some(max_capacity),
            ..ValidatorUpdate::for_id(ValidatorId::new(id).unwrap())
        }
    }

    fn submission() -> NewJob {
        NewJob {
            requester: "w".into(),
            prompt: "p".into(),
            model: "m".into(),
            max_tokens: 8,
            paid_amount: 1,
            payment_proof: "burn".into(),
        }
    }

    fn dispatcher(store: Arc<InMemoryJobStore>, registry: Arc<ValidatorRegistry>) -> QueueDispatcher {
        QueueDispatcher::with_rng(
            store,
            registry,
            ValidatorSelector::default(),
            DispatcherConfig::default(),
            StdRng::seed_from_u64(7),
        )
    }

    #[tokio::test]
    async fn single_eligible_validator_gets_the_job() {
        let store = InMemoryJobStore::arc();
        let registry = Arc::new(ValidatorRegistry::seeded([validator("only", 4)], Utc::now()));
        let job = store.create_job(submission()).await.unwrap();

        let assigned = dispatcher(store.clone(), registry).try_assign(&job).await.unwrap().unwrap();

        assert_eq!(assigned.status, JobStatus::Processing);
        assert_eq!(assigned.assigned_validator.unwrap().as_str(), "only");
        assert_eq!(assigned.validator_endpoint.as_deref(), Some("http://only"));
    }

    #[tokio::test]
    async fn no_eligible_validator_leaves_job_queued() {
        let store = InMemoryJobStore::arc();
        let registry = Arc::new(ValidatorRegistry::seeded([validator("full", 0)], Utc::now()));
        let job = store.create_job(submission()).await.unwrap();

        assert!(dispatcher(store.clone(), registry).try_assign(&job).await.unwrap().is_none());
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn pass_respects_capacity_within_the_batch() {
        let store = InMemoryJobStore::arc();
        let registry = Arc::new(ValidatorRegistry::seeded([validator("v1", 2)], Utc::now()));
        for _ in 0..3 {
            store.create_job(submission()).await.unwrap();
        }

        let assigned = dispatcher(store.clone(), registry).dispatch_queued().await.unwrap();

        assert_eq!(assigned, 2);
        assert_eq!(store.get_jobs_by_status(JobStatus::Queued).await.unwrap().len(), 1);
    }
}
