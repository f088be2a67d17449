// Anthropic driver: messages API through the LLM port

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use weft_core::error::{EngineError, Result};
use weft_core::traits::{LlmDriver, LlmGeneration, LlmRequest, LlmUsage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicDriver {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicDriver {
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

    /// Requires ANTHROPIC_API_KEY
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| EngineError::ProviderKeyMissing("anthropic".to_string()))?;
        Ok(Self::new(api_key))
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[async_trait]
impl LlmDriver for AnthropicDriver {
    async fn generate(&self, request: LlmRequest) -> Result<LlmGeneration> {
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);

        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(Duration::from_millis(request.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::node(format!("Anthropic request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::node(format!(
                "Anthropic returned {status}: {body}"
            )));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| EngineError::node(format!("Failed to parse Anthropic response: {e}")))?;

        let content = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        let usage = parsed
            .usage
            .map(|u| {
                let input = u.input_tokens.unwrap_or(0);
                let output = u.output_tokens.unwrap_or(0);
                LlmUsage {
                    total_tokens: input + output,
                    prompt_tokens: input,
                    completion_tokens: output,
                }
            })
            .unwrap_or_default();

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(model, duration_ms, "anthropic generation finished");

        Ok(LlmGeneration {
            content,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            provider: "anthropic".to_string(),
            usage,
            duration_ms,
        })
    }
}
