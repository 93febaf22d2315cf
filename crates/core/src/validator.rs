//! Validator snapshot as seen by the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ValidatorId;

/// Highest reputation a validator can hold.
pub const MAX_REPUTATION: u32 = 100;

/// A candidate worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub id: ValidatorId,
    pub endpoint: String,
    pub wallet_address: String,
    /// Staked tokens
    pub stake: u64,
    /// 0-100 score
    pub reputation: u32,
    /// Average response time
    pub latency_ms: u64,
    /// Current concurrent requests
    pub capacity_used: u32,
    /// Max concurrent requests
    pub max_capacity: u32,
    pub last_active: DateTime<Utc>,
}

impl Validator {
    pub fn has_spare_capacity(&self) -> bool {
        self.capacity_used < self.max_capacity
    }

    pub fn spare_capacity(&self) -> u32 {
        self.max_capacity.saturating_sub(self.capacity_used)
    }

    /// Apply a partial update and refresh `last_active`.
    pub fn merge(&mut self, update: ValidatorUpdate, now: DateTime<Utc>) {
        if let Some(endpoint) = update.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(wallet) = update.wallet_address {
            self.wallet_address = wallet;
        }
        if let Some(stake) = update.stake {
            self.stake = stake;
        }
        if let Some(reputation) = update.reputation {
            self.reputation = reputation.min(MAX_REPUTATION);
        }
        if let Some(latency) = update.latency_ms {
            self.latency_ms = latency;
        }
        if let Some(used) = update.capacity_used {
            self.capacity_used = used;
        }
        if let Some(max) = update.max_capacity {
            self.max_capacity = max;
        }
        self.last_active = now;
    }
}

/// Partial validator update, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    pub id: Option<ValidatorId>,
    pub endpoint: Option<String>,
    pub wallet_address: Option<String>,
    pub stake: Option<u64>,
    pub reputation: Option<u32>,
    pub latency_ms: Option<u64>,
    pub capacity_used: Option<u32>,
    pub max_capacity: Option<u32>,
}

impl ValidatorUpdate {
    pub fn for_id(id: ValidatorId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// Build a full validator for an id the registry has not seen yet.
    ///
    /// Missing fields fall back to an empty, zero-capacity node that selection
    /// will skip until a later update fills them in.
    pub fn into_validator(self, id: ValidatorId, now: DateTime<Utc>) -> Validator {
        let mut v = Validator {
            endpoint: String::new(),
            wallet_address: String::new(),
            stake: 0,
            reputation: 0,
            latency_ms: 0,
            capacity_used: 0,
            max_capacity: 0,
            last_active: now,
            id,
        };
        v.merge(self, now);
        v
    }
}
