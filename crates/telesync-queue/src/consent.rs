//! Consent precondition client.
//!
//! Callers grant scopes for a participant before enqueuing their events.
//! This crate never blocks delivery on consent; it only offers the call.

use serde::Serialize;
use telesync_core::Scope;
use tracing::info;

use crate::error::DeliveryError;
use crate::http::{API_KEY_HEADER, classify};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsentRequest {
    pub participant_id: String,
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone)]
pub struct ConsentClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl ConsentClient {
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

    /// Record the scopes a participant has granted.
    pub async fn grant(&self, participant_id: &str, scopes: &[Scope]) -> Result<(), DeliveryError> {
        let body = ConsentRequest {
            participant_id: participant_id.to_string(),
            scopes: scopes.to_vec(),
        };
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request.send().await?;
        classify(response.status())?;
        info!(participant_id, scopes = scopes.len(), "consent: scopes granted");
        Ok(())
    }
}
