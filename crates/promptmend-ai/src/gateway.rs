// ABOUTME: Single choke point for LLM calls made by the repair pipeline
// ABOUTME: Resolves per-step sampling parameters and maps provider failures to ServiceError

use crate::llm_provider::{GenerationConfig, LLMProvider};
use once_cell::sync::Lazy;
use promptmend_core::{PromptMendError, Result, StepOverride};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Sampling parameters applied to one named pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSampling {
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Used for any step name missing from the table
pub const DEFAULT_STEP_SAMPLING: StepSampling = StepSampling {
    temperature: 0.5,
    max_tokens: 1500,
};

/// Built-in steps; `[steps]` in the config may add or override entries.
/// Compression is local and never reaches the gateway.
static STEP_TABLE: Lazy<HashMap<&'static str, StepSampling>> = Lazy::new(|| {
    HashMap::from([
        (
            "diagnosis",
            StepSampling {
                temperature: 0.2,
                max_tokens: 2500,
            },
        ),
        (
            "solution",
            StepSampling {
                temperature: 0.7,
                max_tokens: 2500,
            },
        ),
        (
            "validation",
            StepSampling {
                temperature: 0.1,
                max_tokens: 1000,
            },
        ),
    ])
});

/// Raw text returned by one gateway invocation plus whatever usage the
/// service reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: Option<usize>,
    pub completion_tokens: Option<usize>,
    pub total_tokens: Option<usize>,
    pub model: String,
}

pub struct LLMGateway {
    provider: Arc<dyn LLMProvider>,
    overrides: BTreeMap<String, StepOverride>,
    default_sampling: StepSampling,
}

impl LLMGateway {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            overrides: BTreeMap::new(),
            default_sampling: DEFAULT_STEP_SAMPLING,
        }
    }

    /// Layer configured per-step overrides on top of the built-in table
    pub fn with_step_overrides(mut self, overrides: BTreeMap<String, StepOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Temperature used for steps that are not in the table
    pub fn with_default_temperature(mut self, temperature: f32) -> Self {
        self.default_sampling.temperature = temperature;
        self
    }

    pub fn provider(&self) -> &Arc<dyn LLMProvider> {
        &self.provider
    }

    pub fn sampling_for(&self, step: &str) -> StepSampling {
        let mut sampling = STEP_TABLE
            .get(step)
            .copied()
            .unwrap_or(self.default_sampling);

        if let Some(step_override) = self.overrides.get(step) {
            if let Some(temperature) = step_override.temperature {
                sampling.temperature = temperature;
            }
            if let Some(max_tokens) = step_override.max_tokens {
                sampling.max_tokens = max_tokens;
            }
        }

        sampling
    }

    /// Call the provider exactly once for `step`. Failures are surfaced as
    /// `ServiceError` with the provider's full context chain.
    pub async fn invoke(&self, prompt: &str, step: &str) -> Result<Completion> {
        let sampling = self.sampling_for(step);
        let config = GenerationConfig {
            temperature: sampling.temperature,
            max_tokens: Some(sampling.max_tokens),
            ..Default::default()
        };

        debug!(
            step,
            provider = self.provider.provider_name(),
            temperature = sampling.temperature,
            max_tokens = sampling.max_tokens,
            "Invoking LLM"
        );
        let start = Instant::now();

        match self.provider.generate_with_config(prompt, &config).await {
            Ok(response) => {
                debug!(
                    step,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    total_tokens = ?response.total_tokens,
                    "LLM call completed"
                );
                Ok(Completion {
                    text: response.content,
                    prompt_tokens: response.prompt_tokens,
                    completion_tokens: response.completion_tokens,
                    total_tokens: response.total_tokens,
                    model: response.model,
                })
            }
            Err(e) => {
                warn!(step, "LLM call failed: {:#}", e);
                Err(PromptMendError::Service(format!("{:#}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_provider::{LLMResponse, LLMResult, Message, ProviderCharacteristics};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvider {
        configs: Mutex<Vec<GenerationConfig>>,
        fail: bool,
    }

    #[async_trait]
    impl LLMProvider for RecordingProvider {
        async fn generate_chat(
            &self,
            messages: &[Message],
            config: &GenerationConfig,
        ) -> LLMResult<LLMResponse> {
            self.configs.lock().unwrap().push(config.clone());
            if self.fail {
                return Err(anyhow!("connection reset").context("Failed to send request"));
            }
            Ok(LLMResponse::text(messages[0].content.to_uppercase(), "recorder"))
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn provider_name(&self) -> &str {
            "recorder"
        }

        fn model_name(&self) -> &str {
            "recorder"
        }

        fn characteristics(&self) -> ProviderCharacteristics {
            ProviderCharacteristics {
                max_tokens: 8192,
                avg_latency_ms: 0,
                rpm_limit: None,
            }
        }
    }

    #[test]
    fn test_step_table_and_fallback() {
        let gateway = LLMGateway::new(Arc::new(RecordingProvider::default()));

        let diagnosis = gateway.sampling_for("diagnosis");
        let solution = gateway.sampling_for("solution");
        assert!(diagnosis.temperature < solution.temperature);
        assert_eq!(gateway.sampling_for("no-such-step"), DEFAULT_STEP_SAMPLING);
        assert_eq!(gateway.sampling_for("compression"), DEFAULT_STEP_SAMPLING);
    }

    #[test]
    fn test_overrides_replace_individual_fields() {
        let overrides = BTreeMap::from([(
            "diagnosis".to_string(),
            StepOverride {
                temperature: Some(0.0),
                max_tokens: None,
            },
        )]);
        let gateway =
            LLMGateway::new(Arc::new(RecordingProvider::default())).with_step_overrides(overrides);

        let sampling = gateway.sampling_for("diagnosis");
        assert_eq!(sampling.temperature, 0.0);
        assert_eq!(sampling.max_tokens, 2500);
    }

    #[tokio::test]
    async fn test_invoke_calls_provider_once_with_step_sampling() {
        let provider = Arc::new(RecordingProvider::default());
        let gateway = LLMGateway::new(provider.clone());

        let completion = gateway.invoke("check this", "validation").await.unwrap();
        assert_eq!(completion.text, "CHECK THIS");
        assert_eq!(completion.total_tokens, None);

        let configs = provider.configs.lock().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].temperature, 0.1);
        assert_eq!(configs[0].max_tokens, Some(1000));
    }

    #[tokio::test]
    async fn test_failures_become_service_errors_without_retry() {
        let provider = Arc::new(RecordingProvider {
            fail: true,
            ..Default::default()
        });
        let gateway = LLMGateway::new(provider.clone());

        let err = gateway.invoke("x", "diagnosis").await.unwrap_err();
        match err {
            PromptMendError::Service(message) => {
                assert!(message.contains("Failed to send request"));
                assert!(message.contains("connection reset"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(provider.configs.lock().unwrap().len(), 1);
    }
}
