pub mod http;
pub mod registry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use registry::{BackendDescriptor, BackendRegistry, BackendSettings, SettingsOverride};

/// Contract every concrete backend client implements. The pool owns
/// constructed clients and hands them out one caller at a time.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse>;

    /// Best-effort probe. Implementations enforce their own short timeout.
    async fn health_check(&self) -> Result<bool>;

    /// Idempotent resource release.
    async fn close(&self);

    fn backend_name(&self) -> &str;
}

pub type SharedClient = Arc<dyn BackendClient>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: String,
    pub query: String,
    pub context_tag: String,
    pub system_prompt: Option<String>,
    pub params: GenerationParams,
    pub timeout: Option<Duration>,
}

impl GenerationRequest {
    pub fn new(query: impl Into<String>, context_tag: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            query: query.into(),
            context_tag: context_tag.into(),
            system_prompt: None,
            params: GenerationParams::default(),
            timeout: Some(Duration::from_secs(60)),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: Some(0.2),
            max_tokens: Some(1024),
        }
    }
}

/// One backend's completed answer. Immutable once produced; the consensus
/// engine only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResponse {
    pub backend: String,
    pub request_id: String,
    pub text: String,
    /// Backend-reported confidence estimate in [0, 1].
    pub reported_confidence: f64,
    pub latency: Duration,
    pub usage: Option<TokenUsage>,
    pub estimated_cost: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl BackendResponse {
    pub fn ok(
        backend: impl Into<String>,
        request_id: impl Into<String>,
        text: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            backend: backend.into(),
            request_id: request_id.into(),
            text: text.into(),
            reported_confidence: 0.5,
            latency,
            usage: None,
            estimated_cost: None,
            created_at: Utc::now(),
            error: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.reported_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none() && !self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingInfo {
    pub input_price_per_1k_tokens: Decimal,
    pub output_price_per_1k_tokens: Decimal,
}

impl PricingInfo {
    pub fn calculate_cost(&self, usage: &TokenUsage) -> Decimal {
        let input = Decimal::from(usage.input_tokens) * self.input_price_per_1k_tokens
            / Decimal::from(1000);
        let output = Decimal::from(usage.output_tokens) * self.output_price_per_1k_tokens
            / Decimal::from(1000);
        input + output
    }
}

impl fmt::Display for BackendResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} in {}ms] {}",
            self.backend,
            self.latency.as_millis(),
            self.text
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = GenerationRequest::new("what is a DUAT?", "land_law")
            .with_system_prompt("answer precisely")
            .with_timeout(Duration::from_secs(10));

        assert_eq!(req.context_tag, "land_law");
        assert_eq!(req.timeout, Some(Duration::from_secs(10)));
        assert!(req.system_prompt.is_some());
        assert!(!req.id.is_empty());
    }

    #[test]
    fn test_response_validity() {
        let ok = BackendResponse::ok("a", "r1", "some answer", Duration::from_millis(10));
        assert!(ok.is_valid());

        let empty = BackendResponse::ok("a", "r1", "   ", Duration::from_millis(10));
        assert!(!empty.is_valid());

        let mut failed = BackendResponse::ok("a", "r1", "text", Duration::from_millis(10));
        failed.error = Some("boom".to_string());
        assert!(!failed.is_valid());
    }

    #[test]
    fn test_confidence_clamped() {
        let resp = BackendResponse::ok("a", "r1", "x", Duration::ZERO).with_confidence(1.7);
        assert_eq!(resp.reported_confidence, 1.0);
    }

    #[test]
    fn test_cost_calculation() {
        let pricing = PricingInfo {
            input_price_per_1k_tokens: Decimal::new(3, 3),   // 0.003
            output_price_per_1k_tokens: Decimal::new(15, 3), // 0.015
        };
        let usage = TokenUsage::new(1000, 2000);
        assert_eq!(pricing.calculate_cost(&usage), Decimal::new(33, 3));
    }
}
