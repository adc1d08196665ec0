//! # Stage: Advisory
//!
//! ## Responsibility
//! The boundary to the text-producing advisory service. Components describe
//! what they want via an [`AdvisoryRequest`] and receive raw text back; JSON
//! payloads are pulled out of that text with [`extract_json_array`].
//!
//! ## Guarantees
//! - Typed failures: every error is an [`AdvisoryError`] variant, never a
//!   string to be pattern-matched
//! - Soft parsing: extraction helpers return `None` instead of failing
//!
//! ## NOT Responsible For
//! - Fallback content (each call site owns its deterministic fallback)
//! - Prompt wording beyond the request purpose

pub mod breaker;
pub mod client;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::config::AdvisorySettings;

pub use breaker::CircuitBreaker;
pub use client::{HttpAdvisoryClient, HttpAdvisoryClientBuilder};

// ---------------------------------------------------------------------------
// Request / error types
// ---------------------------------------------------------------------------

/// What an advisory call is for. Drives the default token budget and shows up
/// in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvisoryPurpose {
    TestInsight,
    TestVariants,
    Predictions,
    Recommendations,
    ExecutiveSummary,
    LearningReport,
}

impl AdvisoryPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestInsight => "test_insight",
            Self::TestVariants => "test_variants",
            Self::Predictions => "predictions",
            Self::Recommendations => "recommendations",
            Self::ExecutiveSummary => "executive_summary",
            Self::LearningReport => "learning_report",
        }
    }

    fn default_max_tokens(self) -> u32 {
        match self {
            Self::TestInsight => 300,
            Self::TestVariants => 800,
            Self::Predictions | Self::Recommendations => 1500,
            Self::ExecutiveSummary => 600,
            Self::LearningReport => 2000,
        }
    }
}

impl std::fmt::Display for AdvisoryPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryRequest {
    pub purpose: AdvisoryPurpose,
    pub prompt: String,
    pub max_tokens: u32,
}

impl AdvisoryRequest {
    pub fn new(purpose: AdvisoryPurpose, prompt: impl Into<String>) -> Self {
        Self { purpose, prompt: prompt.into(), max_tokens: purpose.default_max_tokens() }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdvisoryError {
    /// TCP-level failure or a transport error before a status was received.
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },
    /// Non-2xx reply.
    #[error("HTTP {status} from advisory service")]
    Http { status: u16 },
    #[error("advisory request timed out")]
    Timeout,
    /// Reply arrived but did not have the expected shape.
    #[error("malformed advisory response: {0}")]
    Malformed(String),
    /// Too many consecutive failures; calls fail fast until the cooldown ends.
    #[error("advisory circuit open")]
    CircuitOpen,
    #[error("advisory service disabled")]
    Disabled,
}

// ---------------------------------------------------------------------------
// Service trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AdvisoryService: Send + Sync {
    /// Produce text for `request`.
    async fn complete(&self, request: AdvisoryRequest) -> Result<String, AdvisoryError>;
}

/// Advisor that refuses every call. Used when the service is switched off or
/// has no credentials; every caller falls back to deterministic output.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAdvisor;

#[async_trait]
impl AdvisoryService for DisabledAdvisor {
    async fn complete(&self, _request: AdvisoryRequest) -> Result<String, AdvisoryError> {
        Err(AdvisoryError::Disabled)
    }
}

/// Build the advisor described by `settings`: an HTTP client behind a circuit
/// breaker, or [`DisabledAdvisor`] when disabled or missing an API key.
pub fn from_settings(settings: &AdvisorySettings) -> Arc<dyn AdvisoryService> {
    if !settings.enabled {
        return Arc::new(DisabledAdvisor);
    }
    if settings.api_key.is_empty() {
        warn!(target: "optimizer::advisory", "advisory enabled but no API key set, using fallbacks");
        return Arc::new(DisabledAdvisor);
    }
    let client = HttpAdvisoryClient::builder(&settings.base_url, &settings.api_key)
        .model(&settings.model)
        .connect_timeout(settings.connect_timeout())
        .request_timeout(settings.request_timeout())
        .build();
    Arc::new(CircuitBreaker::new(client, settings.failure_threshold, settings.cooldown()))
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

fn slice_between(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Parse the first `[` .. last `]` span of `text` as a JSON array.
pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    let slice = slice_between(text, '[', ']')?;
    match serde_json::from_str::<Value>(slice).ok()? {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
