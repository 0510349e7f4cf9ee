//! Outbound webhook collaborator.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook transport error: {0}")]
    Transport(String),
}

/// Sends a request and reports the response status. Bodies are never read.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn call(&self, request: &WebhookRequest) -> Result<u16, WebhookError>;
}

/// reqwest-backed client. Timeouts are applied by the caller.
#[derive(Debug, Clone, Default)]
pub struct HttpWebhookClient {
    client: reqwest::Client,
}

impl HttpWebhookClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn call(&self, request: &WebhookRequest) -> Result<u16, WebhookError> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| WebhookError::Transport(e.to_string()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| WebhookError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        debug!(url = %request.url, status, "Webhook delivered");
        Ok(status)
    }
}

/// Client that records requests and answers with scripted statuses
/// (200 once the script runs out).
#[derive(Debug, Default)]
pub struct RecordingWebhookClient {
    requests: Mutex<Vec<WebhookRequest>>,
    scripted: Mutex<VecDeque<Result<u16, WebhookError>>>,
}

impl RecordingWebhookClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, response: Result<u16, WebhookError>) {
        self.scripted.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl WebhookClient for RecordingWebhookClient {
    async fn call(&self, request: &WebhookRequest) -> Result<u16, WebhookError> {
        self.requests.lock().push(request.clone());
        self.scripted.lock().pop_front().unwrap_or(Ok(200))
    }
}
