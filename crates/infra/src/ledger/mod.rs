//! Ledger capability: payments, refunds, memo anchoring and validator metadata.
//!
//! The router never signs transactions itself. `HttpLedger` delegates to a
//! signing gateway; `InMemoryLedger` is a scriptable fake for tests/dev.

pub mod http;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use swarmrouter_core::{ValidatorId, ValidatorUpdate};

use crate::http::HttpError;

pub use http::HttpLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Confirmed,
    Pending,
    Failed,
}

/// Authoritative validator metadata as registered on-chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnChainValidator {
    pub id: ValidatorId,
    #[serde(alias = "wallet")]
    pub wallet_address: String,
    #[serde(default)]
    pub stake: u64,
    #[serde(default)]
    pub reputation: u32,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl OnChainValidator {
    pub fn into_update(self) -> ValidatorUpdate {
        ValidatorUpdate {
            endpoint: self.endpoint,
            wallet_address: Some(self.wallet_address),
            stake: Some(self.stake),
            reputation: Some(self.reputation),
            ..ValidatorUpdate::for_id(self.id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger call timed out")]
    Timeout,
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger rejected request: {0}")]
    Rejected(String),
    #[error("malformed ledger response: {0}")]
    Malformed(String),
}

impl From<HttpError> for LedgerError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Timeout => LedgerError::Timeout,
            HttpError::Network(msg) => LedgerError::Unavailable(msg),
            HttpError::Api(status, body) if status >= 500 => {
                LedgerError::Unavailable(format!("{status}: {body}"))
            }
            HttpError::Api(status, body) => LedgerError::Rejected(format!("{status}: {body}")),
            HttpError::Parse(msg) => LedgerError::Malformed(msg),
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Check that `signature` is a burn of at least `expected_amount`.
    async fn verify_burn(&self, signature: &str, expected_amount: u64) -> Result<bool, LedgerError>;

    /// Submit a memo transaction; returns its signature.
    async fn submit_memo(&self, memo: &[u8]) -> Result<String, LedgerError>;

    async fn confirmation_status(&self, signature: &str) -> Result<ConfirmationStatus, LedgerError>;

    /// Transfer `amount` to `wallet`; returns the transfer signature.
    async fn transfer(&self, wallet: &str, amount: u64) -> Result<String, LedgerError>;

    /// Pay a validator its fee for a completed job.
    async fn distribute_fee(
        &self,
        user_wallet: &str,
        validator_wallet: &str,
        amount: u64,
    ) -> Result<String, LedgerError>;

    /// Set a validator's on-chain reputation score.
    async fn update_reputation(&self, validator_wallet: &str, score: u32) -> Result<String, LedgerError>;

    async fn validators(&self) -> Result<Vec<OnChainValidator>, LedgerError>;
}

#[async_trait]
impl<L: Ledger + ?Sized> Ledger for Arc<L> {
    async fn verify_burn(&self, signature: &str, expected_amount: u64) -> Result<bool, LedgerError> {
        (**self).verify_burn(signature, expected_amount).await
    }

    async fn submit_memo(&self, memo: &[u8]) -> Result<String, LedgerError> {
        (**self).submit_memo(memo).await
    }

    async fn confirmation_status(&self, signature: &str) -> Result<ConfirmationStatus, LedgerError> {
        (**self).confirmation_status(signature).await
    }

    async fn transfer(&self, wallet: &str, amount: u64) -> Result<String, LedgerError> {
        (**self).transfer(wallet, amount).await
    }

    async fn distribute_fee(
        &self,
        user_wallet: &str,
        validator_wallet: &str,
        amount: u64,
    ) -> Result<String, LedgerError> {
        (**self).distribute_fee(user_wallet, validator_wallet, amount).await
    }

    async fn update_reputation(&self, validator_wallet: &str, score: u32) -> Result<String, LedgerError> {
        (**self).update_reputation(validator_wallet, score).await
    }

    async fn validators(&self) -> Result<Vec<OnChainValidator>, LedgerError> {
        (**self).validators().await
    }
}

/// A transfer recorded by [`InMemoryLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTransfer {
    pub wallet: String,
    pub amount: u64,
    pub signature: String,
}

/// Scriptable in-memory ledger for tests/dev.
#[derive(Debug)]
pub struct InMemoryLedger {
    next_sig: AtomicU64,
    burns_valid: AtomicBool,
    memos_fail: AtomicBool,
    fees_fail: AtomicBool,
    transfer_failures: AtomicU32,
    default_status: Mutex<ConfirmationStatus>,
    statuses: Mutex<HashMap<String, ConfirmationStatus>>,
    memos: Mutex<Vec<Vec<u8>>>,
    transfers: Mutex<Vec<RecordedTransfer>>,
    fees: Mutex<Vec<RecordedTransfer>>,
    reputation: Mutex<Vec<(String, u32)>>,
    validators: Mutex<Vec<OnChainValidator>>,
    validators_fail: AtomicBool,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self {
            next_sig: AtomicU64::new(1),
            burns_valid: AtomicBool::new(true),
            memos_fail: AtomicBool::new(false),
            fees_fail: AtomicBool::new(false),
            transfer_failures: AtomicU32::new(0),
            default_status: Mutex::new(ConfirmationStatus::Confirmed),
            statuses: Mutex::new(HashMap::new()),
            memos: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
            fees: Mutex::new(Vec::new()),
            reputation: Mutex::new(Vec::new()),
            validators: Mutex::new(Vec::new()),
            validators_fail: AtomicBool::new(false),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn signature(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.next_sig.fetch_add(1, Ordering::SeqCst))
    }

    pub fn set_burns_valid(&self, valid: bool) {
        self.burns_valid.store(valid, Ordering::SeqCst);
    }

    pub fn set_memos_fail(&self, fail: bool) {
        self.memos_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_fees_fail(&self, fail: bool) {
        self.fees_fail.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` transfers with `Unavailable`.
    pub fn fail_next_transfers(&self, n: u32) {
        self.transfer_failures.store(n, Ordering::SeqCst);
    }

    /// Status reported for signatures without an explicit override.
    pub fn set_default_status(&self, status: ConfirmationStatus) {
        *lock(&self.default_status) = status;
    }

    pub fn set_status(&self, signature: &str, status: ConfirmationStatus) {
        lock(&self.statuses).insert(signature.to_string(), status);
    }

    pub fn set_validators(&self, validators: Vec<OnChainValidator>) {
        *lock(&self.validators) = validators;
    }

    pub fn set_validators_fail(&self, fail: bool) {
        self.validators_fail.store(fail, Ordering::SeqCst);
    }

    pub fn memos(&self) -> Vec<Vec<u8>> {
        lock(&self.memos).clone()
    }

    pub fn transfers(&self) -> Vec<RecordedTransfer> {
        lock(&self.transfers).clone()
    }

    pub fn fees(&self) -> Vec<RecordedTransfer> {
        lock(&self.fees).clone()
    }

    pub fn reputation_updates(&self) -> Vec<(String, u32)> {
        lock(&self.reputation).clone()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn verify_burn(&self, _signature: &str, _expected_amount: u64) -> Result<bool, LedgerError> {
        Ok(self.burns_valid.load(Ordering::SeqCst))
    }

    async fn submit_memo(&self, memo: &[u8]) -> Result<String, LedgerError> {
        if self.memos_fail.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("memo submission disabled".to_string()));
        }
        lock(&self.memos).push(memo.to_vec());
        Ok(self.signature("memo"))
    }

    async fn confirmation_status(&self, signature: &str) -> Result<ConfirmationStatus, LedgerError> {
        let status = lock(&self.statuses).get(signature).copied();
        Ok(status.unwrap_or(*lock(&self.default_status)))
    }

    async fn transfer(&self, wallet: &str, amount: u64) -> Result<String, LedgerError> {
        let failing = self
            .transfer_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Unavailable("transfer rejected by fake".to_string()));
        }

        let signature = self.signature("refund");
        lock(&self.transfers).push(RecordedTransfer {
            wallet: wallet.to_string(),
            amount,
            signature: signature.clone(),
        });
        Ok(signature)
    }

    async fn distribute_fee(
        &self,
        _user_wallet: &str,
        validator_wallet: &str,
        amount: u64,
    ) -> Result<String, LedgerError> {
        if self.fees_fail.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("fee distribution disabled".to_string()));
        }
        let signature = self.signature("fee");
        lock(&self.fees).push(RecordedTransfer {
            wallet: validator_wallet.to_string(),
            amount,
            signature: signature.clone(),
        });
        Ok(signature)
    }

    async fn update_reputation(&self, validator_wallet: &str, score: u32) -> Result<String, LedgerError> {
        lock(&self.reputation).push((validator_wallet.to_string(), score));
        Ok(self.signature("rep"))
    }

    async fn validators(&self) -> Result<Vec<OnChainValidator>, LedgerError> {
        if self.validators_fail.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("registry read disabled".to_string()));
        }
        Ok(lock(&self.validators).clone())
    }
}
