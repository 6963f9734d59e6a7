use crate::llm_provider::*;
use anyhow::{anyhow, Result};
use promptmend_core::config_manager::LLMConfig;
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "anthropic")]
use crate::anthropic_provider::{AnthropicConfig, AnthropicProvider};

#[cfg(feature = "openai-compatible")]
use crate::openai_compatible_provider::{OpenAICompatibleConfig, OpenAICompatibleProvider};

/// Factory for creating LLM providers based on configuration
pub struct LLMProviderFactory;

impl LLMProviderFactory {
    /// Create an LLM provider from configuration
    pub fn create_from_config(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let provider_name = config.provider.to_lowercase();
        info!("🤖 Creating LLM provider: {}", provider_name);

        match provider_name.as_str() {
            #[cfg(feature = "anthropic")]
            "anthropic" => Self::create_anthropic_provider(config),
            #[cfg(feature = "openai-compatible")]
            "openai" => Self::create_openai_provider(config),
            #[cfg(feature = "openai-compatible")]
            "openai-compatible" => Self::create_openai_compatible_provider(config),
            #[cfg(feature = "openai-compatible")]
            "lmstudio" => Self::create_lmstudio_provider(config),
            #[cfg(feature = "openai-compatible")]
            "ollama" => Self::create_ollama_provider(config),
            _ => Err(anyhow!(
                "Unsupported LLM provider: {}. Available providers: {}",
                provider_name,
                Self::supported_providers().join(", ")
            )),
        }
    }

    /// Create an Anthropic Claude provider
    #[cfg(feature = "anthropic")]
    fn create_anthropic_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let api_key = config
            .anthropic_api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| {
                anyhow!(
                    "Anthropic API key not found. Set 'anthropic_api_key' in config \
                     or ANTHROPIC_API_KEY environment variable"
                )
            })?;

        let mut anthropic_config = AnthropicConfig {
            api_key,
            context_window: config.context_window,
            timeout_secs: config.timeout_secs,
            ..Default::default()
        };
        if let Some(model) = &config.model {
            anthropic_config.model = model.clone();
        }

        Ok(Arc::new(AnthropicProvider::new(anthropic_config)?))
    }

    /// Create a provider for the hosted OpenAI API
    #[cfg(feature = "openai-compatible")]
    fn create_openai_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let api_key = config
            .openai_api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                anyhow!(
                    "OpenAI API key not found. Set 'openai_api_key' in config \
                     or OPENAI_API_KEY environment variable"
                )
            })?;

        let openai_config = OpenAICompatibleConfig {
            context_window: config.context_window,
            timeout_secs: config.timeout_secs,
            ..OpenAICompatibleConfig::openai(
                api_key,
                config.model.clone().unwrap_or_else(|| "gpt-4o".to_string()),
            )
        };

        Ok(Arc::new(OpenAICompatibleProvider::new(openai_config)?))
    }

    /// Create an OpenAI-compatible provider
    #[cfg(feature = "openai-compatible")]
    fn create_openai_compatible_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let base_url = config.openai_compatible_url.clone().ok_or_else(|| {
            anyhow!("OpenAI-compatible base URL not found. Set 'openai_compatible_url' in config")
        })?;

        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("Model name is required for OpenAI-compatible provider"))?;

        let compat_config = OpenAICompatibleConfig {
            context_window: config.context_window,
            timeout_secs: config.timeout_secs,
            api_key: config.openai_api_key.clone(),
            ..OpenAICompatibleConfig::custom(base_url, model, "openai-compatible".to_string())
        };

        Ok(Arc::new(OpenAICompatibleProvider::new(compat_config)?))
    }

    /// Create a provider using LM Studio's OpenAI-compatible endpoint
    #[cfg(feature = "openai-compatible")]
    fn create_lmstudio_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let compat_config = OpenAICompatibleConfig {
            context_window: config.context_window,
            timeout_secs: config.timeout_secs,
            ..OpenAICompatibleConfig::lm_studio(
                &config.lmstudio_url,
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| "local-model".to_string()),
            )
        };

        Ok(Arc::new(OpenAICompatibleProvider::new(compat_config)?))
    }

    /// Create a provider using Ollama's OpenAI-compatible endpoint
    #[cfg(feature = "openai-compatible")]
    fn create_ollama_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let compat_config = OpenAICompatibleConfig {
            context_window: config.context_window,
            timeout_secs: config.timeout_secs,
            ..OpenAICompatibleConfig::ollama(
                &config.ollama_url,
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| "qwen2.5:14b".to_string()),
            )
        };

        Ok(Arc::new(OpenAICompatibleProvider::new(compat_config)?))
    }

    /// Get a list of supported providers (based on enabled features)
    pub fn supported_providers() -> Vec<&'static str> {
        #[allow(unused_mut)]
        let mut providers = Vec::new();

        #[cfg(feature = "anthropic")]
        providers.push("anthropic");

        #[cfg(feature = "openai-compatible")]
        providers.extend(["openai", "openai-compatible", "lmstudio", "ollama"]);

        providers
    }
}
