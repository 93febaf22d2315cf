//! Content-addressed storage capability (pinning).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::instrument;

use swarmrouter_core::sha256_hex;

use crate::http::{HttpError, send_json};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentStoreError {
    #[error("pinning service unavailable: {0}")]
    Unavailable(String),
    #[error("pinning service returned no content id")]
    MissingCid,
}

impl From<HttpError> for ContentStoreError {
    fn from(err: HttpError) -> Self {
        ContentStoreError::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Pin `bytes` and return their content identifier.
    async fn pin(&self, bytes: &[u8]) -> Result<String, ContentStoreError>;
}

#[async_trait]
impl<C: ContentStore + ?Sized> ContentStore for Arc<C> {
    async fn pin(&self, bytes: &[u8]) -> Result<String, ContentStoreError> {
        (**self).pin(bytes).await
    }
}

/// Identifier derived from the content digest alone, used when nothing is pinned.
pub fn local_content_id(bytes: &[u8]) -> String {
    let digest = sha256_hex(bytes);
    format!("Qm{}", &digest[..44])
}

/// Client for an IPFS pinning API.
#[derive(Debug, Clone)]
pub struct HttpContentStore {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpContentStore {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            token,
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pinata wants JSON wrapped in `pinataContent`; other gateways take it as is.
    fn payload(&self, bytes: &[u8]) -> JsonValue {
        let content = serde_json::from_slice::<JsonValue>(bytes)
            .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(bytes).into_owned()));
        if self.api_url.contains("pinata") {
            json!({ "pinataContent": content })
        } else {
            content
        }
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    #[instrument(skip(self, bytes), fields(len = bytes.len()), err)]
    async fn pin(&self, bytes: &[u8]) -> Result<String, ContentStoreError> {
        let mut req = self
            .client
            .post(&self.api_url)
            .timeout(self.timeout)
            .json(&self.payload(bytes));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp: JsonValue = send_json(req).await?;
        extract_cid(&resp).ok_or(ContentStoreError::MissingCid)
    }
}

fn extract_cid(resp: &JsonValue) -> Option<String> {
    ["cid", "Hash", "hash"]
        .iter()
        .filter_map(|k| resp.get(*k).and_then(JsonValue::as_str))
        .find(|cid| !cid.is_empty())
        .map(str::to_string)
}

/// In-memory content store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    pinned: Mutex<Vec<(String, Vec<u8>)>>,
    failing: AtomicBool,
    attempts: AtomicU32,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn pinned(&self) -> Vec<(String, Vec<u8>)> {
        self.pinned.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn pin(&self, bytes: &[u8]) -> Result<String, ContentStoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ContentStoreError::Unavailable("pinning disabled".to_string()));
        }
        let cid = format!("bafy{}", &sha256_hex(bytes)[..40]);
        self.pinned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((cid.clone(), bytes.to_vec()));
        Ok(cid)
    }
}
