use std::time::Duration;

use serde::{Deserialize, Serialize};

use swarmrouter_core::{MAX_REPUTATION, Validator};

use crate::SelectionError;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Weights of the four score factors. Always sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    stake: f64,
    reputation: f64,
    capacity: f64,
    speed: f64,
}

impl ScoringWeights {
    pub fn new(stake: f64, reputation: f64, capacity: f64, speed: f64) -> Result<Self, SelectionError> {
        let all = [stake, reputation, capacity, speed];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SelectionError::InvalidWeights(format!(
                "weights must be finite and non-negative, got {all:?}"
            )));
        }
        let sum: f64 = all.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(SelectionError::InvalidWeights(format!(
                "weights must sum to 1, got {sum}"
            )));
        }
        Ok(Self {
            stake,
            reputation,
            capacity,
            speed,
        })
    }

    pub fn stake(&self) -> f64 {
        self.stake
    }

    pub fn reputation(&self) -> f64 {
        self.reputation
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            stake: 0.4,
            reputation: 0.3,
            capacity: 0.2,
            speed: 0.1,
        }
    }
}

/// Scoring and eligibility parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub weights: ScoringWeights,
    /// Stake at or above this scores 1.0 on the stake factor
    pub max_stake: u64,
    /// Latency at or above this scores 0.0 on the speed factor
    pub max_latency_ms: u64,
    /// Validators not seen for this long are treated as offline
    pub liveness_window: Duration,
    /// Size of the pool the weighted draw picks from
    pub top_n: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            max_stake: 100_000,
            max_latency_ms: 2_000,
            liveness_window: Duration::from_secs(60),
            top_n: 3,
        }
    }
}

/// Score a validator in \[0, 1\].
///
/// Weighted sum of stake (capped at `max_stake`), reputation / 100, spare
/// capacity ratio and `1 - latency / max_latency` (floored at 0).
pub fn calculate_score(config: &SelectionConfig, v: &Validator) -> f64 {
    let stake_score = if config.max_stake == 0 {
        0.0
    } else {
        v.stake.min(config.max_stake) as f64 / config.max_stake as f64
    };

    let reputation_score = v.reputation.min(MAX_REPUTATION) as f64 / MAX_REPUTATION as f64;

    let capacity_score = if v.max_capacity == 0 {
        0.0
    } else {
        v.spare_capacity() as f64 / v.max_capacity as f64
    };

    let speed_score = if config.max_latency_ms == 0 {
        0.0
    } else {
        let latency = v.latency_ms.max(1) as f64;
        (1.0 - latency / config.max_latency_ms as f64).max(0.0)
    };

    let w = &config.weights;
    let total = stake_score * w.stake()
        + reputation_score * w.reputation()
        + capacity_score * w.capacity()
        + speed_score * w.speed();

    total.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use swarmrouter_core::ValidatorId;

    fn validator(stake: u64, reputation: u32, latency_ms: u64, used: u32, max: u32) -> Validator {
        Validator {
            id: ValidatorId::new("v").unwrap(),
            endpoint: "https://v".to_string(),
            wallet_address: "w".to_string(),
            stake,
            reputation,
            latency_ms,
            capacity_used: used,
            max_capacity: max,
            last_active: Utc::now(),
        }
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        assert!(ScoringWeights::new(0.5, 0.5, 0.5, 0.0).is_err());
        assert!(ScoringWeights::new(-0.1, 0.5, 0.5, 0.1).is_err());
        assert!(ScoringWeights::new(0.25, 0.25, 0.25, 0.25).is_ok());
    }

    #[test]
    fn perfect_validator_scores_one() {
        let cfg = SelectionConfig::default();
        let v = validator(200_000, 100, 1, 0, 10);
        let score = calculate_score(&cfg, &v);
        assert!((score - (1.0 - 0.1 / 2000.0)).abs() < 1e-9);
    }

    #[test]
    fn stake_is_capped() {
        let cfg = SelectionConfig::default();
        let capped = calculate_score(&cfg, &validator(100_000, 50, 500, 1, 2));
        let whale = calculate_score(&cfg, &validator(10_000_000, 50, 500, 1, 2));
        assert_eq!(capped, whale);
    }

    #[test]
    fn mixed_factors_follow_weights() {
        let cfg = SelectionConfig::default();
        // stake 0.5, rep 0.5, capacity 0.5, speed 0.5
        let v = validator(50_000, 50, 1_000, 5, 10);
        assert!((calculate_score(&cfg, &v) - 0.5).abs() < 1e-9);
    }
}
