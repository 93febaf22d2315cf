//! Shared plumbing for the HTTP-backed capability clients.

use std::time::Duration;

use serde::de::DeserializeOwned;

/// Transport-level failure of an outbound call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("api error {0}: {1}")]
    Api(u16, String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout
        } else {
            HttpError::Network(err.to_string())
        }
    }
}

/// Build the process-wide client. Individual calls may tighten the timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, HttpError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| HttpError::Network(e.to_string()))
}

/// Send, reject non-2xx and decode the JSON body.
pub async fn send_json<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> Result<T, HttpError> {
    let resp = send(req).await?;
    resp.json::<T>().await.map_err(|e| HttpError::Parse(e.to_string()))
}

/// Send and reject non-2xx, ignoring the body.
pub async fn send(req: reqwest::RequestBuilder) -> Result<reqwest::Response, HttpError> {
    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(HttpError::Api(status.as_u16(), resp.text().await.unwrap_or_default()));
    }
    Ok(resp)
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
