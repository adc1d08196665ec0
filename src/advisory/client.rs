//! HTTP client for a Messages-style text completion endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AdvisoryError, AdvisoryRequest, AdvisoryService};

const API_VERSION: &str = "2023-06-01";

// --- wire types ---------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

// --- client -------------------------------------------------------------------

/// Non-streaming advisory client. Construct with [`HttpAdvisoryClient::builder`].
pub struct HttpAdvisoryClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl HttpAdvisoryClient {
    pub fn builder(base_url: impl Into<String>, api_key: impl Into<String>) -> HttpAdvisoryClientBuilder {
        HttpAdvisoryClientBuilder::new(base_url, api_key)
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    /// Pull the concatenated text blocks out of a response body.
    fn parse_body(bytes: &[u8]) -> Result<String, AdvisoryError> {
        let resp: MessagesResponse =
            serde_json::from_slice(bytes).map_err(|e| AdvisoryError::Malformed(e.to_string()))?;
        let text: String = resp
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        if text.is_empty() {
            return Err(AdvisoryError::Malformed("no text content".into()));
        }
        Ok(text)
    }
}

#[async_trait]
impl AdvisoryService for HttpAdvisoryClient {
    async fn complete(&self, request: AdvisoryRequest) -> Result<String, AdvisoryError> {
        let url = self.endpoint();
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            messages: vec![Message { role: "user", content: &request.prompt }],
            stream: false,
        };
        debug!(target: "optimizer::advisory", purpose = %request.purpose, "advisory request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdvisoryError::Timeout
                } else {
                    AdvisoryError::Connect { url: url.clone(), detail: e.to_string() }
                }
            })?;

        if !resp.status().is_success() {
            return Err(AdvisoryError::Http { status: resp.status().as_u16() });
        }

        let bytes = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                AdvisoryError::Timeout
            } else {
                AdvisoryError::Malformed(e.to_string())
            }
        })?;
        Self::parse_body(&bytes)
    }
}

/// Builder for [`HttpAdvisoryClient`].
pub struct HttpAdvisoryClientBuilder {
    base_url: String,
    api_key: String,
    model: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpAdvisoryClientBuilder {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: "claude-3-5-sonnet-20241022".into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> HttpAdvisoryClient {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .unwrap_or_default();
        HttpAdvisoryClient {
            base_url: self.base_url,
            api_key: self.api_key,
            model: self.model,
            client,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
