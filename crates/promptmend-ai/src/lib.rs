pub mod gateway;
pub mod llm_factory;
pub mod llm_provider;

// Cloud and local LLM providers
#[cfg(feature = "anthropic")]
pub mod anthropic_provider;
#[cfg(feature = "openai-compatible")]
pub mod openai_compatible_provider;

pub use gateway::{Completion, LLMGateway, StepSampling, DEFAULT_STEP_SAMPLING};
pub use llm_factory::LLMProviderFactory;
pub use llm_provider::*;
