//! Weighted-random validator selection.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};

use swarmrouter_core::Validator;

use crate::scoring::{SelectionConfig, calculate_score};

/// A validator paired with its score.
#[derive(Debug, Clone, Copy)]
pub struct ScoredValidator<'a> {
    pub validator: &'a Validator,
    pub score: f64,
}

/// Picks a validator for each job.
///
/// Stateless apart from its config; callers pass the snapshot, the clock and
/// the random source so the outcome is reproducible under test.
#[derive(Debug, Clone, Default)]
pub struct ValidatorSelector {
    config: SelectionConfig,
}

impl ValidatorSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    pub fn calculate_score(&self, validator: &Validator) -> f64 {
        calculate_score(&self.config, validator)
    }

    /// Spare capacity and seen within the liveness window.
    pub fn is_eligible(&self, validator: &Validator, now: DateTime<Utc>) -> bool {
        if !validator.has_spare_capacity() {
            return false;
        }
        // A clock ahead of ours counts as fresh.
        match (now - validator.last_active).to_std() {
            Ok(age) => age < self.config.liveness_window,
            Err(_) => true,
        }
    }

    /// Eligible candidates, best first. Ties break on id so the order does
    /// not depend on how the snapshot was collected.
    pub fn rank<'a>(&self, candidates: &'a [Validator], now: DateTime<Utc>) -> Vec<ScoredValidator<'a>> {
        let mut ranked: Vec<ScoredValidator<'a>> = candidates
            .iter()
            .filter(|v| self.is_eligible(v, now))
            .map(|v| ScoredValidator {
                validator: v,
                score: self.calculate_score(v),
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.validator.id.as_str().cmp(b.validator.id.as_str()))
        });
        ranked
    }

    /// Choose among the top-N eligible validators with probability
    /// proportional to score. Uniform when every score in the pool is 0.
    ///
    /// Returns `None` when nothing is eligible.
    pub fn select_best_validator<'a, R>(
        &self,
        candidates: &'a [Validator],
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Option<&'a Validator>
    where
        R: Rng + ?Sized,
    {
        let mut pool = self.rank(candidates, now);
        pool.truncate(self.config.top_n.max(1));

        match pool.len() {
            0 => return None,
            1 => return Some(pool[0].validator),
            _ => {}
        }

        let index = match WeightedIndex::new(pool.iter().map(|s| s.score)) {
            Ok(dist) => dist.sample(rng),
            // All-zero weights
            Err(_) => rng.gen_range(0..pool.len()),
        };

        Some(pool[index].validator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use swarmrouter_core::ValidatorId;

    fn validator(id: &str, stake: u64, reputation: u32, used: u32, max: u32, seen: DateTime<Utc>) -> Validator {
        Validator {
            id: ValidatorId::new(id).unwrap(),
            endpoint: format!("https://{id}.test"),
            wallet_address: format!("{id}-wallet"),
            stake,
            reputation,
            latency_ms: 100,
            capacity_used: used,
            max_capacity: max,
            last_active: seen,
        }
    }

    #[test]
    fn returns_none_when_nothing_is_eligible() {
        let now = Utc::now();
        let selector = ValidatorSelector::default();
        let mut rng = StdRng::seed_from_u64(7);

        assert!(selector.select_best_validator(&[], now, &mut rng).is_none());

        let full = validator("full", 10_000, 90, 5, 5, now);
        let stale = validator("stale", 10_000, 90, 0, 5, now - Duration::seconds(61));
        assert!(selector
            .select_best_validator(&[full, stale], now, &mut rng)
            .is_none());
    }

    #[test]
    fn single_eligible_validator_is_always_chosen() {
        let now = Utc::now();
        let selector = ValidatorSelector::default();
        let mut rng = StdRng::seed_from_u64(1);
        let pool = vec![
            validator("busy", 100_000, 100, 8, 8, now),
            validator("only", 1, 1, 0, 8, now - Duration::seconds(30)),
        ];

        for _ in 0..50 {
            let picked = selector.select_best_validator(&pool, now, &mut rng).unwrap();
            assert_eq!(picked.id.as_str(), "only");
        }
    }

    #[test]
    fn draw_is_limited_to_top_n() {
        let now = Utc::now();
        let selector = ValidatorSelector::default();
        let mut rng = StdRng::seed_from_u64(42);
        let pool = vec![
            validator("a", 90_000, 90, 0, 8, now),
            validator("b", 80_000, 80, 0, 8, now),
            validator("c", 70_000, 70, 0, 8, now),
            validator("d", 1_000, 10, 0, 8, now),
        ];

        for _ in 0..500 {
            let picked = selector.select_best_validator(&pool, now, &mut rng).unwrap();
            assert_ne!(picked.id.as_str(), "d");
        }
    }

    #[test]
    fn higher_scores_win_more_often() {
        let now = Utc::now();
        let selector = ValidatorSelector::default();
        let mut rng = StdRng::seed_from_u64(2024);
        let pool = vec![
            validator("high", 100_000, 100, 0, 8, now),
            validator("mid", 40_000, 40, 4, 8, now),
            validator("low", 5_000, 5, 7, 8, now),
        ];

        let mut counts = std::collections::HashMap::new();
        for _ in 0..10_000 {
            let picked = selector.select_best_validator(&pool, now, &mut rng).unwrap();
            *counts.entry(picked.id.as_str().to_string()).or_insert(0u32) += 1;
        }

        let high = counts["high"];
        let mid = counts["mid"];
        let low = counts.get("low").copied().unwrap_or(0);
        assert!(high > mid, "high={high} mid={mid}");
        assert!(mid > low, "mid={mid} low={low}");
        assert!(low > 0);
    }

    #[test]
    fn zero_scores_fall_back_to_uniform() {
        let now = Utc::now();
        let weights = crate::ScoringWeights::new(1.0, 0.0, 0.0, 0.0).unwrap();
        let selector = ValidatorSelector::new(SelectionConfig {
            weights,
            ..SelectionConfig::default()
        });
        let mut rng = StdRng::seed_from_u64(3);
        let pool = vec![
            validator("x", 0, 50, 0, 8, now),
            validator("y", 0, 50, 0, 8, now),
            validator("z", 0, 50, 0, 8, now),
        ];

        let mut seen = std::collections::HashSet::new();
        for _ in 0..300 {
            let picked = selector.select_best_validator(&pool, now, &mut rng).unwrap();
            seen.insert(picked.id.as_str().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    fn arb_validator(now: DateTime<Utc>) -> impl Strategy<Value = Validator> {
        (
            "[a-z]{1,8}",
            0u64..1_000_000,
            0u32..200,
            0u64..10_000,
            0u32..20,
            0u32..20,
            0i64..180,
        )
            .prop_map(move |(id, stake, reputation, latency_ms, used, max, age)| Validator {
                id: ValidatorId::new(id).unwrap(),
                endpoint: "https://node".to_string(),
                wallet_address: "wallet".to_string(),
                stake,
                reputation,
                latency_ms,
                capacity_used: used,
                max_capacity: max,
                last_active: now - Duration::seconds(age),
            })
    }

    proptest! {
        #[test]
        fn score_is_always_in_unit_interval(v in arb_validator(Utc::now())) {
            let score = ValidatorSelector::default().calculate_score(&v);
            prop_assert!((0.0..=1.0).contains(&score));
        }

        #[test]
        fn never_selects_an_ineligible_validator(
            pool in prop::collection::vec(arb_validator(Utc::now()), 0..12),
            seed in any::<u64>(),
        ) {
            let now = Utc::now();
            let selector = ValidatorSelector::default();
            let mut rng = StdRng::seed_from_u64(seed);
            match selector.select_best_validator(&pool, now, &mut rng) {
                Some(v) => {
                    prop_assert!(v.has_spare_capacity());
                    prop_assert!(now - v.last_active < Duration::seconds(60));
                }
                None => prop_assert!(pool.iter().all(|v| !selector.is_eligible(v, now))),
            }
        }
    }
}
