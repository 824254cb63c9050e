use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use url::Url;

use crate::backend::registry::{BackendSettings, ClientConstructor};
use crate::backend::{
    BackendClient, BackendResponse, GenerationRequest, PricingInfo, SharedClient, TokenUsage,
};
use crate::error::{Error, Result};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Chat-completions client for any OpenAI-compatible endpoint. One instance
/// is one pooled handle; the pool constructs as many as the concurrency
/// limit allows.
pub struct HttpBackend {
    name: String,
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    pricing: Option<PricingInfo>,
}

impl HttpBackend {
    pub fn new(name: impl Into<String>, settings: &BackendSettings) -> Result<Self> {
        let name = name.into();
        let base_url = settings
            .endpoint
            .clone()
            .ok_or_else(|| Error::construction(&name, "no endpoint configured"))?;
        Url::parse(&base_url)
            .map_err(|e| Error::construction(&name, format!("invalid endpoint URL: {}", e)))?;
        let model = settings
            .model
            .clone()
            .ok_or_else(|| Error::construction(&name, "no model configured"))?;

        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| {
                Error::construction(&name, format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            name,
            client,
            base_url,
            model,
            api_key: settings.api_key.clone(),
            pricing: settings.pricing.clone(),
        })
    }

    /// Constructor closure suitable for registry registration.
    pub fn constructor(name: impl Into<String>) -> ClientConstructor {
        let name = name.into();
        Arc::new(move |settings: &BackendSettings| {
            Ok(Arc::new(HttpBackend::new(name.clone(), settings)?) as SharedClient)
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| Error::backend(&self.name, "invalid API key characters"))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn chat_completion(&self, request: &GenerationRequest) -> Result<CompletionResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));

        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user".to_string(),
            content: request.query.clone(),
        });

        let body = CompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: request.params.temperature,
            max_tokens: request.params.max_tokens,
        };

        debug!(backend = %self.name, model = %self.model, "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::backend(&self.name, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(backend = %self.name, %status, "API error: {}", error_text);
            return Err(Error::backend(
                &self.name,
                format!("API error {}: {}", status, error_text),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| Error::backend(&self.name, format!("failed to parse response: {}", e)))
    }
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse> {
        let start = Instant::now();
        let completion = self.chat_completion(request).await?;
        let latency = start.elapsed();

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::backend(&self.name, "no choices in response"))?;

        let usage = completion
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        let estimated_cost = match (&self.pricing, &usage) {
            (Some(pricing), Some(usage)) => Some(pricing.calculate_cost(usage)),
            _ => None,
        };

        // Providers rarely expose calibrated confidence over the wire; a
        // truncated answer is trusted less than a clean stop.
        let reported_confidence = match choice.finish_reason.as_deref() {
            Some("stop") | None => 0.7,
            Some("length") => 0.5,
            Some(_) => 0.4,
        };

        debug!(
            backend = %self.name,
            latency_ms = latency.as_millis() as u64,
            "Completion received"
        );

        Ok(BackendResponse {
            backend: self.name.clone(),
            request_id: request.id.clone(),
            text: choice.message.content,
            reported_confidence,
            latency,
            usage,
            estimated_cost,
            created_at: Utc::now(),
            error: None,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));

        let probe = self.client.get(&url).headers(self.headers()?).send();
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe).await {
            Ok(Ok(response)) => Ok(response.status().is_success()),
            Ok(Err(e)) => {
                warn!(backend = %self.name, "Health probe failed: {}", e);
                Ok(false)
            }
            Err(_) => {
                warn!(backend = %self.name, "Health probe timed out");
                Ok(false)
            }
        }
    }

    async fn close(&self) {
        // reqwest clients release their connections on drop; nothing to do,
        // and calling this twice is harmless.
        debug!(backend = %self.name, "Closing HTTP backend client");
    }

    fn backend_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(endpoint: Option<&str>, model: Option<&str>) -> BackendSettings {
        BackendSettings {
            endpoint: endpoint.map(String::from),
            model: model.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_endpoint_and_model() {
        match HttpBackend::new("b", &settings(None, Some("m"))) {
            Err(Error::Construction { backend, .. }) => assert_eq!(backend, "b"),
            other => panic!("expected Construction error, got ok={}", other.is_ok()),
        }
        assert!(HttpBackend::new("b", &settings(Some("http://x"), None)).is_err());
        assert!(HttpBackend::new("b", &settings(Some("not a url"), Some("m"))).is_err());
        assert!(HttpBackend::new("b", &settings(Some("http://x"), Some("m"))).is_ok());
    }

    #[test]
    fn test_constructor_closure() {
        let ctor = HttpBackend::constructor("local");
        let ok = ctor(&settings(Some("http://localhost:8080"), Some("llama")));
        assert!(ok.is_ok());
        assert_eq!(ok.unwrap().backend_name(), "local");
    }

    #[test]
    fn test_wire_request_shape() {
        let body = CompletionRequest {
            model: "m".to_string(),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            temperature: None,
            max_tokens: Some(16),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["max_tokens"], 16);
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
