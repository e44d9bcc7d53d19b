use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::logs::BackendError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin JSON client for the log query service.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url).with_context(|| format!("invalid API URL '{base_url}'"))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("logq/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POSTs `body` and decodes the JSON reply.
    ///
    /// Non-2xx replies become a [`BackendError`] carrying the status and, when
    /// the body is JSON, the parsed payload.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, BackendError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| BackendError::new(format!("request to {url} failed: {err}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| BackendError::new(format!("failed to read response: {err}")))?;

        if !status.is_success() {
            return Err(error_from_body(status.as_u16(), &text));
        }

        let body = if text.trim().is_empty() { "null" } else { &text };
        serde_json::from_str(body).map_err(|err| {
            BackendError::new(format!("failed to parse response from {url}: {err}"))
                .with_status(status.as_u16())
        })
    }
}

fn error_from_body(status: u16, text: &str) -> BackendError {
    let payload = serde_json::from_str::<Value>(text).ok();
    let message = payload
        .as_ref()
        .and_then(|value| value.get("message").or_else(|| value.get("error")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                "request failed".to_string()
            } else {
                trimmed.to_string()
            }
        });

    let err = BackendError::new(message).with_status(status);
    match payload {
        Some(payload) => err.with_payload(payload),
        None => err,
    }
}
