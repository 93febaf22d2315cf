//! Ledger client backed by a signing gateway and a JSON-RPC node.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, instrument};

use super::{ConfirmationStatus, Ledger, LedgerError, OnChainValidator};
use crate::http::{join_url, send_json};

#[derive(Debug, Clone)]
pub struct HttpLedger {
    client: reqwest::Client,
    gateway_url: String,
    rpc_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct BurnResponse {
    valid: bool,
}

impl HttpLedger {
    pub fn new(
        client: reqwest::Client,
        gateway_url: impl Into<String>,
        rpc_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            gateway_url: gateway_url.into(),
            rpc_url: rpc_url.into(),
            timeout,
        }
    }

    async fn post_for_signature(&self, path: &str, body: JsonValue) -> Result<String, LedgerError> {
        let req = self
            .client
            .post(join_url(&self.gateway_url, path))
            .timeout(self.timeout)
            .json(&body);
        let resp: SignatureResponse = send_json(req).await?;
        if resp.signature.is_empty() {
            return Err(LedgerError::Malformed(format!("empty signature from {path}")));
        }
        Ok(resp.signature)
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    #[instrument(skip(self), err)]
    async fn verify_burn(&self, signature: &str, expected_amount: u64) -> Result<bool, LedgerError> {
        let req = self
            .client
            .post(join_url(&self.gateway_url, "/v1/burns/verify"))
            .timeout(self.timeout)
            .json(&json!({ "signature": signature, "expected_amount": expected_amount }));
        let resp: BurnResponse = send_json(req).await?;
        Ok(resp.valid)
    }

    #[instrument(skip(self, memo), fields(memo_len = memo.len()), err)]
    async fn submit_memo(&self, memo: &[u8]) -> Result<String, LedgerError> {
        let memo = String::from_utf8_lossy(memo);
        self.post_for_signature("/v1/memos", json!({ "memo": memo })).await
    }

    #[instrument(skip(self), err)]
    async fn confirmation_status(&self, signature: &str) -> Result<ConfirmationStatus, LedgerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getSignatureStatuses",
            "params": [[signature], { "searchTransactionHistory": true }],
        });
        let req = self.client.post(&self.rpc_url).timeout(self.timeout).json(&body);
        let resp: JsonValue = send_json(req).await?;

        if let Some(err) = resp.get("error") {
            return Err(LedgerError::Rejected(err.to_string()));
        }
        let status = parse_signature_status(&resp);
        debug!(?status, "signature status");
        Ok(status)
    }

    #[instrument(skip(self), err)]
    async fn transfer(&self, wallet: &str, amount: u64) -> Result<String, LedgerError> {
        self.post_for_signature("/v1/transfers", json!({ "wallet": wallet, "amount": amount }))
            .await
    }

    #[instrument(skip(self), err)]
    async fn distribute_fee(
        &self,
        user_wallet: &str,
        validator_wallet: &str,
        amount: u64,
    ) -> Result<String, LedgerError> {
        self.post_for_signature(
            "/v1/fees",
            json!({
                "user_wallet": user_wallet,
                "validator_wallet": validator_wallet,
                "amount": amount,
            }),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn update_reputation(&self, validator_wallet: &str, score: u32) -> Result<String, LedgerError> {
        self.post_for_signature("/v1/reputation", json!({ "wallet": validator_wallet, "score": score }))
            .await
    }

    #[instrument(skip(self), err)]
    async fn validators(&self) -> Result<Vec<OnChainValidator>, LedgerError> {
        let req = self
            .client
            .get(join_url(&self.gateway_url, "/v1/validators"))
            .timeout(self.timeout);
        Ok(send_json(req).await?)
    }
}

/// Read `result.value[0]` of a `getSignatureStatuses` reply.
///
/// Unknown signatures come back as `null` and count as pending.
fn parse_signature_status(resp: &JsonValue) -> ConfirmationStatus {
    let info = resp.pointer("/result/value/0").filter(|v| !v.is_null());
    let Some(info) = info else {
        return ConfirmationStatus::Pending;
    };

    if info.get("err").is_some_and(|e| !e.is_null()) {
        return ConfirmationStatus::Failed;
    }

    match info.get("confirmationStatus").and_then(JsonValue::as_str) {
        Some("confirmed") | Some("finalized") => ConfirmationStatus::Confirmed,
        _ => ConfirmationStatus::Pending,
    }
}
