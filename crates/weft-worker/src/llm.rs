// Routed LLM driver: per-provider dispatch with key fallback
//
// The configured provider is tried first; when the user has no key for it,
// the other known providers are tried in order and the fallback is logged.
// No key anywhere raises ProviderKeyMissing, which surfaces as the step's
// failure.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use weft_anthropic::AnthropicDriver;
use weft_core::error::{EngineError, Result};
use weft_core::traits::{ApiKeyResolver, LlmDriver, LlmGeneration, LlmRequest};
use weft_openai::OpenAiDriver;

const KNOWN_PROVIDERS: &[&str] = &["openai", "anthropic"];
const DEFAULT_PROVIDER: &str = "openai";

pub struct RoutedLlmDriver {
    resolver: Arc<dyn ApiKeyResolver>,
}

impl RoutedLlmDriver {
    pub fn new(resolver: Arc<dyn ApiKeyResolver>) -> Self {
        Self { resolver }
    }

    /// The requested provider first, then the remaining known providers
    fn provider_order(requested: &str) -> Vec<&'static str> {
        let mut order: Vec<&'static str> = Vec::with_capacity(KNOWN_PROVIDERS.len());
        if let Some(&known) = KNOWN_PROVIDERS.iter().find(|&&p| p == requested) {
            order.push(known);
        } else {
            warn!(provider = requested, "unknown provider requested, using fallback order");
        }
        for &provider in KNOWN_PROVIDERS {
            if !order.contains(&provider) {
                order.push(provider);
            }
        }
        order
    }

    fn driver_for(provider: &str, api_key: String) -> Arc<dyn LlmDriver> {
        match provider {
            "anthropic" => Arc::new(AnthropicDriver::new(api_key)),
            _ => Arc::new(OpenAiDriver::new(api_key)),
        }
    }
}

#[async_trait]
impl LlmDriver for RoutedLlmDriver {
    async fn generate(&self, request: LlmRequest) -> Result<LlmGeneration> {
        let requested = request
            .provider
            .clone()
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

        for provider in Self::provider_order(&requested) {
            let Some(api_key) = self.resolver.resolve(provider).await? else {
                continue;
            };
            if provider != requested {
                info!(
                    requested = %requested,
                    using = provider,
                    "no key for requested provider, falling back"
                );
            }
            let mut routed = request.clone();
            routed.provider = Some(provider.to_string());
            // A model name configured for another provider is dropped on
            // fallback so the driver's default applies
            if provider != requested {
                routed.model = None;
            }
            return Self::driver_for(provider, api_key).generate(routed).await;
        }

        Err(EngineError::ProviderKeyMissing(requested))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapResolver {
        keys: HashMap<&'static str, &'static str>,
    }

    #[async_trait]
    impl ApiKeyResolver for MapResolver {
        async fn resolve(&self, provider: &str) -> Result<Option<String>> {
            Ok(self.keys.get(provider).map(|k| k.to_string()))
        }
    }

    #[test]
    fn requested_provider_comes_first() {
        assert_eq!(
            RoutedLlmDriver::provider_order("anthropic"),
            vec!["anthropic", "openai"]
        );
        assert_eq!(
            RoutedLlmDriver::provider_order("openai"),
            vec!["openai", "anthropic"]
        );
    }

    #[test]
    fn unknown_provider_falls_back_to_known_order() {
        assert_eq!(
            RoutedLlmDriver::provider_order("mystery"),
            vec!["openai", "anthropic"]
        );
    }

    #[tokio::test]
    async fn no_keys_anywhere_is_provider_key_missing() {
        let driver = RoutedLlmDriver::new(Arc::new(MapResolver {
            keys: HashMap::new(),
        }));
        let err = driver
            .generate(LlmRequest {
                prompt: "hi".to_string(),
                provider: Some("anthropic".to_string()),
                ..LlmRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProviderKeyMissing(p) if p == "anthropic"));
    }
}
