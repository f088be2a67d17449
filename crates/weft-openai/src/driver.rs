// OpenAI driver: chat completions through the LLM port

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use weft_core::error::{EngineError, Result};
use weft_core::traits::{LlmDriver, LlmGeneration, LlmRequest, LlmUsage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiDriver {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiDriver {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Requires OPENAI_API_KEY
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EngineError::ProviderKeyMissing("openai".to_string()))?;
        Ok(Self::new(api_key))
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[async_trait]
impl LlmDriver for OpenAiDriver {
    async fn generate(&self, request: LlmRequest) -> Result<LlmGeneration> {
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);

        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_millis(request.timeout_ms))
            .json(&json!({
                "model": model,
                "messages": messages,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
            }))
            .send()
            .await
            .map_err(|e| EngineError::node(format!("OpenAI request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::node(format!(
                "OpenAI returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::node(format!("Failed to parse OpenAI response: {e}")))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let usage = parsed.usage.map(|u| LlmUsage {
            total_tokens: u.total_tokens.unwrap_or(0),
            prompt_tokens: u.prompt_tokens.unwrap_or(0),
            completion_tokens: u.completion_tokens.unwrap_or(0),
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(model, duration_ms, "openai generation finished");

        Ok(LlmGeneration {
            content,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            provider: "openai".to_string(),
            usage: usage.unwrap_or_default(),
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn generates_from_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                "model": "gpt-4o-mini",
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            })))
            .mount(&server)
            .await;

        let driver = OpenAiDriver::with_base_url("sk-test".to_string(), server.uri());
        let generation = driver
            .generate(LlmRequest {
                prompt: "say hello".to_string(),
                ..LlmRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(generation.content, "hello");
        assert_eq!(generation.provider, "openai");
        assert_eq!(generation.usage.total_tokens, 7);
    }

    #[tokio::test]
    async fn system_prompt_is_sent_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "messages": [
                    {"role": "system", "content": "be terse"},
                    {"role": "user", "content": "hi"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "ok"}}]
            })))
            .mount(&server)
            .await;

        let driver = OpenAiDriver::with_base_url("sk-test".to_string(), server.uri());
        let generation = driver
            .generate(LlmRequest {
                prompt: "hi".to_string(),
                system_prompt: Some("be terse".to_string()),
                ..LlmRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(generation.content, "ok");
    }

    #[tokio::test]
    async fn api_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let driver = OpenAiDriver::with_base_url("sk-test".to_string(), server.uri());
        let err = driver
            .generate(LlmRequest {
                prompt: "hi".to_string(),
                ..LlmRequest::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("429"));
    }
}
