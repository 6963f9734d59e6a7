use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::PromptMendError {
    fn from(err: ConfigError) -> Self {
        crate::PromptMendError::Config(err.to_string())
    }
}

/// Main configuration for PromptMend
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptMendConfig {
    /// LLM provider used for diagnosis and validation
    #[serde(default)]
    pub llm: LLMConfig,

    /// Defaults for the bot model whose prompt is being repaired
    #[serde(default)]
    pub model: ModelDefaults,

    /// Token encoding table used for budgeting
    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    /// Repair loop settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Per-step sampling overrides keyed by step name
    #[serde(default)]
    pub steps: BTreeMap<String, StepOverride>,

    /// Prompt compression heuristics
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Result cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// LLM provider: "anthropic", "openai", "openai-compatible", "lmstudio", "ollama"
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Model identifier
    /// For Anthropic: model name (e.g., "claude-3-5-sonnet-20241022")
    /// For OpenAI: model name (e.g., "gpt-4o")
    /// For OpenAI-compatible: custom model name
    #[serde(default)]
    pub model: Option<String>,

    /// LM Studio URL
    #[serde(default = "default_lmstudio_url")]
    pub lmstudio_url: String,

    /// Ollama URL
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// OpenAI-compatible base URL (for custom endpoints)
    #[serde(default)]
    pub openai_compatible_url: Option<String>,

    /// Anthropic API key
    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    /// OpenAI API key
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Context window size of the analysis model
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            lmstudio_url: default_lmstudio_url(),
            ollama_url: default_ollama_url(),
            openai_compatible_url: None,
            anthropic_api_key: None,
            openai_api_key: None,
            context_window: default_context_window(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Defaults applied when a request carries no model settings of its own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefaults {
    /// Token limit the budget is computed from
    #[serde(default = "default_model_max_tokens")]
    pub max_tokens: usize,

    /// Sampling temperature used for unrecognized steps
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_model_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Where the token encoding table comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// "bytes" (built-in byte-level table), "file" or "pretrained"
    #[serde(default = "default_tokenizer_source")]
    pub source: String,

    /// Path to a HuggingFace tokenizer.json when source = "file"
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Hub identifier when source = "pretrained"
    #[serde(default = "default_pretrained_tokenizer")]
    pub identifier: String,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            source: default_tokenizer_source(),
            path: None,
            identifier: default_pretrained_tokenizer(),
        }
    }
}

/// Repair loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of diagnose/patch/validate rounds
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Minimum validation confidence that accepts a candidate
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// What to do when one modification cannot be applied: "skip" or "abort"
    #[serde(default = "default_patch_failure_policy")]
    pub patch_failure_policy: String,

    /// Minimum similarity for a fuzzy patch location
    #[serde(default = "default_fuzzy_match_threshold")]
    pub fuzzy_match_threshold: f32,

    /// Number of trailing conversation turns forwarded to the diagnosis
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Characters of the governing prompt shown before it is cut
    #[serde(default = "default_prompt_preview_chars")]
    pub prompt_preview_chars: usize,

    /// Tokens kept free when truncating the system instruction
    #[serde(default = "default_system_instruction_reserve")]
    pub system_instruction_reserve: usize,

    /// Wall-clock limit for a whole request
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            confidence_threshold: default_confidence_threshold(),
            patch_failure_policy: default_patch_failure_policy(),
            fuzzy_match_threshold: default_fuzzy_match_threshold(),
            history_window: default_history_window(),
            prompt_preview_chars: default_prompt_preview_chars(),
            system_instruction_reserve: default_system_instruction_reserve(),
            request_timeout_secs: None,
        }
    }
}

/// Sampling override for one named step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOverride {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

/// Prompt compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Items kept from a long list before the elision marker
    #[serde(default = "default_max_list_items")]
    pub max_list_items: usize,

    /// Character cap of an "Example:" block
    #[serde(default = "default_example_char_cap")]
    pub example_char_cap: usize,

    /// Regex recognising a list item line
    #[serde(default = "default_list_item_pattern")]
    pub list_item_pattern: String,

    /// Regex recognising the label that opens an example block
    #[serde(default = "default_example_label_pattern")]
    pub example_label_pattern: String,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_list_items: default_max_list_items(),
            example_char_cap: default_example_char_cap(),
            list_item_pattern: default_list_item_pattern(),
            example_label_pattern: default_example_label_pattern(),
        }
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// "memory" or "disk"
    #[serde(default = "default_cache_backend")]
    pub backend: String,

    /// Directory for the disk backend (defaults to ~/.promptmend/cache)
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            backend: default_cache_backend(),
            directory: None,
        }
    }
}

impl CacheConfig {
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".promptmend")
                .join("cache")
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_llm_provider() -> String {
    "anthropic".to_string()
}
fn default_lmstudio_url() -> String {
    "http://localhost:1234".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_context_window() -> usize {
    200_000
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_model_max_tokens() -> usize {
    4000
}
fn default_temperature() -> f32 {
    0.5
}
fn default_tokenizer_source() -> String {
    "bytes".to_string()
}
fn default_pretrained_tokenizer() -> String {
    "Xenova/gpt-4".to_string()
}
fn default_max_iterations() -> u32 {
    3
}
fn default_confidence_threshold() -> f64 {
    0.85
}
fn default_patch_failure_policy() -> String {
    "skip".to_string()
}
fn default_fuzzy_match_threshold() -> f32 {
    0.75
}
fn default_history_window() -> usize {
    3
}
fn default_prompt_preview_chars() -> usize {
    6000
}
fn default_system_instruction_reserve() -> usize {
    2500
}
fn default_max_list_items() -> usize {
    3
}
fn default_example_char_cap() -> usize {
    200
}
fn default_list_item_pattern() -> String {
    r"^\s*(?:[-*+•]|\d+[.)])\s+\S".to_string()
}
fn default_example_label_pattern() -> String {
    r"(?i)^\s*(?:[-*]\s*)?(?:for\s+)?examples?\s*:".to_string()
}
fn default_cache_enabled() -> bool {
    true
}
fn default_cache_backend() -> String {
    "memory".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration manager with layered sources
pub struct ConfigManager {
    config: PromptMendConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (.promptmend.toml)
    /// 3. Sensible defaults
    pub fn load() -> Result<Self, ConfigError> {
        info!("🔧 Loading PromptMend configuration...");

        Self::load_dotenv();

        let (config, config_path) = Self::load_config_file()?;
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        info!("✅ Configuration loaded successfully");
        if let Some(ref path) = config_path {
            info!("   📄 Config file: {}", path.display());
        } else {
            info!("   📄 Config file: NONE (using defaults)");
        }
        info!("   🤖 LLM provider: {}", config.llm.provider);
        info!("   🔧 LLM model: {:?}", config.llm.model);
        info!(
            "   🔁 Max iterations: {}, confidence threshold: {}",
            config.pipeline.max_iterations, config.pipeline.confidence_threshold
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Load an explicit config file, still honouring environment overrides
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::load_dotenv();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let config = Self::apply_env_overrides(Self::read_toml_file(path)?);
        Self::validate_config(&config)?;

        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an already-built configuration (tests, embedding applications)
    pub fn from_config(config: PromptMendConfig) -> Result<Self, ConfigError> {
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: None,
        })
    }

    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            } else {
                info!("📋 Loaded .env file from current directory");
            }
            return;
        }

        if let Some(home) = dirs::home_dir() {
            let home_env = home.join(".promptmend.env");
            if home_env.exists() {
                if let Err(e) = dotenv::from_path(&home_env) {
                    warn!("Failed to load .promptmend.env: {}", e);
                } else {
                    info!("📋 Loaded .promptmend.env from home directory");
                }
            }
        }
    }

    /// Find and load config file
    /// Search order:
    /// 1. ./.promptmend.toml (current directory)
    /// 2. ~/.promptmend/config.toml (user config)
    /// 3. Use defaults
    fn load_config_file() -> Result<(PromptMendConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".promptmend.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".promptmend").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        info!("📋 No config file found, using defaults");
        Ok((PromptMendConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<PromptMendConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides(mut config: PromptMendConfig) -> PromptMendConfig {
        // LLM configuration
        if let Ok(provider) =
            std::env::var("PROMPTMEND_LLM_PROVIDER").or_else(|_| std::env::var("LLM_PROVIDER"))
        {
            config.llm.provider = provider;
        }
        if let Ok(model) = std::env::var("PROMPTMEND_MODEL") {
            config.llm.model = Some(model);
        }
        if let Ok(url) = std::env::var("PROMPTMEND_OPENAI_COMPATIBLE_URL") {
            config.llm.openai_compatible_url = Some(url);
        }
        if let Ok(url) = std::env::var("PROMPTMEND_OLLAMA_URL") {
            config.llm.ollama_url = url;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            config.llm.anthropic_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.llm.openai_api_key = Some(key);
        }
        if let Ok(timeout) = std::env::var("PROMPTMEND_LLM_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                config.llm.timeout_secs = secs;
            }
        }

        // Pipeline configuration
        if let Ok(iterations) = std::env::var("PROMPTMEND_MAX_ITERATIONS") {
            if let Ok(n) = iterations.parse() {
                config.pipeline.max_iterations = n;
            }
        }
        if let Ok(threshold) = std::env::var("PROMPTMEND_CONFIDENCE_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                config.pipeline.confidence_threshold = t;
            }
        }
        if let Ok(policy) = std::env::var("PROMPTMEND_PATCH_FAILURE_POLICY") {
            config.pipeline.patch_failure_policy = policy.to_lowercase();
        }
        if let Ok(timeout) = std::env::var("PROMPTMEND_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                config.pipeline.request_timeout_secs = Some(secs);
            }
        }

        // Tokenizer
        if let Ok(source) = std::env::var("PROMPTMEND_TOKENIZER") {
            config.tokenizer.source = source.to_lowercase();
        }
        if let Ok(path) = std::env::var("PROMPTMEND_TOKENIZER_PATH") {
            config.tokenizer.path = Some(PathBuf::from(path));
        }

        // Cache
        if let Ok(enabled) = std::env::var("PROMPTMEND_CACHE_ENABLED") {
            config.cache.enabled = enabled.to_lowercase() == "true" || enabled == "1";
        }
        if let Ok(backend) = std::env::var("PROMPTMEND_CACHE_BACKEND") {
            config.cache.backend = backend.to_lowercase();
        }
        if let Ok(dir) = std::env::var("PROMPTMEND_CACHE_DIR") {
            config.cache.directory = Some(PathBuf::from(dir));
        }

        // Logging
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("PROMPTMEND_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    /// Validate configuration
    pub fn validate_config(config: &PromptMendConfig) -> Result<(), ConfigError> {
        match config.llm.provider.as_str() {
            "anthropic" | "openai" | "openai-compatible" | "lmstudio" | "ollama" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid LLM provider: {}. Must be one of: anthropic, openai, openai-compatible, lmstudio, ollama",
                    other
                )))
            }
        }

        match config.tokenizer.source.as_str() {
            "bytes" | "pretrained" => {}
            "file" => {
                if config.tokenizer.path.is_none() {
                    return Err(ConfigError::ValidationError(
                        "tokenizer.source = \"file\" requires tokenizer.path".to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid tokenizer source: {}. Must be one of: bytes, file, pretrained",
                    other
                )))
            }
        }

        let pipeline = &config.pipeline;
        if pipeline.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.max_iterations must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&pipeline.confidence_threshold) {
            return Err(ConfigError::ValidationError(format!(
                "pipeline.confidence_threshold must be within [0, 1], got {}",
                pipeline.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&pipeline.fuzzy_match_threshold) {
            return Err(ConfigError::ValidationError(format!(
                "pipeline.fuzzy_match_threshold must be within [0, 1], got {}",
                pipeline.fuzzy_match_threshold
            )));
        }
        match pipeline.patch_failure_policy.as_str() {
            "skip" | "abort" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid patch failure policy: {}. Must be one of: skip, abort",
                    other
                )))
            }
        }

        match config.cache.backend.as_str() {
            "memory" | "disk" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid cache backend: {}. Must be one of: memory, disk",
                    other
                )))
            }
        }

        // RUST_LOG may carry directives like "promptmend=debug"; only plain levels are checked
        let level = &config.logging.level;
        if !level.contains('=') && !level.contains(',') {
            match level.to_lowercase().as_str() {
                "trace" | "debug" | "info" | "warn" | "error" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                        other
                    )))
                }
            }
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &PromptMendConfig {
        &self.config
    }

    /// Get the path to the config file that was loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = PromptMendConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::ReadError(e.to_string()))?;
            }
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}
