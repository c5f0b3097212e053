//! HTTP remote sink: one JSON POST per flushed batch.

use reqwest::StatusCode;
use telesync_core::EventBatch;
use tracing::debug;

use crate::courier::RemoteSink;
use crate::error::DeliveryError;

pub(crate) const API_KEY_HEADER: &str = "x-api-key";

/// Join a base URL and a path without doubling the slash.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// 2xx is acceptance. 408, 429 and 5xx may succeed later; anything else
/// will not.
pub(crate) fn classify(status: StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    Err(DeliveryError::Rejected {
        status: status.as_u16(),
        retryable,
    })
}

#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: None,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RemoteSink for HttpSink {
    async fn send(&self, batch: &EventBatch) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.url).json(batch);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request.send().await?;
        let status = response.status();
        debug!(url = %self.url, %status, events = batch.events.len(), "http: batch posted");
        classify(status)
    }
}
