//! In-memory validator registry.
//!
//! Readers take a cheap `Arc` clone of the current map and never observe a
//! half-applied sync tick; writers build a new map and swap it in.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::warn;

use swarmrouter_core::{Validator, ValidatorId, ValidatorUpdate};

pub type RegistrySnapshot = Arc<HashMap<ValidatorId, Validator>>;

#[derive(Debug, Default)]
pub struct ValidatorRegistry {
    current: RwLock<RegistrySnapshot>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated from seed updates. Entries without an id are skipped.
    pub fn seeded(seed: impl IntoIterator<Item = ValidatorUpdate>, now: DateTime<Utc>) -> Self {
        let registry = Self::new();
        registry.apply_batch(seed, now);
        registry
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All validators, ordered by id.
    pub fn get_all(&self) -> Vec<Validator> {
        let snapshot = self.snapshot();
        let mut all: Vec<Validator> = snapshot.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn get_by_id(&self, id: &ValidatorId) -> Option<Validator> {
        self.snapshot().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge one partial update, creating the validator if it is new.
    pub fn upsert(&self, update: ValidatorUpdate, now: DateTime<Utc>) -> Option<Validator> {
        let Some(id) = update.id.clone() else {
            warn!("ignoring validator update without an id");
            return None;
        };

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::clone(&guard);
        let merged = merge_into(&mut next, id, update, now);
        *guard = Arc::new(next);
        Some(merged)
    }

    /// Merge a whole sync tick and publish it as one new snapshot.
    pub fn apply_batch(&self, updates: impl IntoIterator<Item = ValidatorUpdate>, now: DateTime<Utc>) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::clone(&guard);
        for update in updates {
            match update.id.clone() {
                Some(id) => {
                    merge_into(&mut next, id, update, now);
                }
                None => warn!("ignoring validator update without an id"),
            }
        }
        *guard = Arc::new(next);
    }

    /// Replace the registry contents wholesale.
    pub fn replace_all(&self, validators: impl IntoIterator<Item = Validator>) {
        let next: HashMap<ValidatorId, Validator> =
            validators.into_iter().map(|v| (v.id.clone(), v)).collect();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}

fn merge_into(
    map: &mut HashMap<ValidatorId, Validator>,
    id: ValidatorId,
    update: ValidatorUpdate,
    now: DateTime<Utc>,
) -> Validator {
    match map.get_mut(&id) {
        Some(existing) => {
            existing.merge(update, now);
            existing.clone()
        }
        None => {
            let created = update.into_validator(id.clone(), now);
            map.insert(id, created.clone());
            created
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ValidatorId {
        ValidatorId::new(s).unwrap()
    }

    #[test]
    fn upsert_merges_and_refreshes_liveness() {
        let registry = ValidatorRegistry::new();
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let t1 = Utc::now();

        registry.upsert(
            ValidatorUpdate {
                stake: Some(8_500),
                reputation: Some(98),
                max_capacity: Some(8),
                ..ValidatorUpdate::for_id(id("validator_001"))
            },
            t0,
        );
        let merged = registry
            .upsert(
                ValidatorUpdate {
                    latency_ms: Some(120),
                    ..ValidatorUpdate::for_id(id("validator_001"))
                },
                t1,
            )
            .unwrap();

        assert_eq!(merged.stake, 8_500);
        assert_eq!(merged.latency_ms, 120);
        assert_eq!(merged.last_active, t1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_without_id_is_ignored() {
        let registry = ValidatorRegistry::new();
        assert!(registry.upsert(ValidatorUpdate::default(), Utc::now()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn old_snapshots_are_unaffected_by_later_batches() {
        let registry = ValidatorRegistry::seeded([ValidatorUpdate::for_id(id("a"))], Utc::now());
        let before = registry.snapshot();

        registry.apply_batch(
            [
                ValidatorUpdate {
                    stake: Some(1),
                    ..ValidatorUpdate::for_id(id("a"))
                },
                ValidatorUpdate::for_id(id("b")),
            ],
            Utc::now(),
        );

        assert_eq!(before.len(), 1);
        assert_eq!(before[&id("a")].stake, 0);
        assert_eq!(registry.get_by_id(&id("a")).unwrap().stake, 1);
        let ids: Vec<String> = registry.get_all().into_iter().map(|v| v.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
