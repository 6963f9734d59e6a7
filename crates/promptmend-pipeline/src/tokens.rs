use promptmend_core::{PromptMendError, Result, TokenizerConfig};
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::info;

/// Used when neither the request nor the configuration names a token limit
pub const DEFAULT_MAX_TOKENS: usize = 4000;

/// Share of the limit kept free for the model's own reply, in percent
pub const SAFETY_MARGIN_PERCENT: usize = 15;

/// Text to token-id mapping the budget is measured in
pub trait TokenEncoder: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, tokens: &[u32]) -> Result<String>;

    fn count(&self, text: &str) -> Result<usize> {
        Ok(self.encode(text)?.len())
    }
}

/// One token per UTF-8 byte. Deterministic and dependency free, and never
/// under-counts relative to a subword vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteLevelEncoder;

impl TokenEncoder for ByteLevelEncoder {
    fn name(&self) -> &str {
        "bytes"
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let bytes = tokens
            .iter()
            .map(|&t| {
                u8::try_from(t).map_err(|_| {
                    PromptMendError::Encoding(format!("token id {} is not a byte", t))
                })
            })
            .collect::<Result<Vec<u8>>>()?;

        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(e) => {
                // A prefix may end inside a multi-byte character; drop the partial tail
                let valid = e.utf8_error().valid_up_to();
                let mut bytes = e.into_bytes();
                bytes.truncate(valid);
                String::from_utf8(bytes).map_err(|e| PromptMendError::Encoding(e.to_string()))
            }
        }
    }
}

/// HuggingFace tokenizer (tokenizer.json) as the encoding table
pub struct HfTokenizerEncoder {
    tokenizer: Tokenizer,
    name: String,
}

impl HfTokenizerEncoder {
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            PromptMendError::Config(format!(
                "Failed to load tokenizer from {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self {
            tokenizer,
            name: path.display().to_string(),
        })
    }

    /// Downloads (or reuses the local hub cache of) a published tokenizer
    pub fn from_pretrained(identifier: &str) -> Result<Self> {
        let tokenizer = Tokenizer::from_pretrained(identifier, None).map_err(|e| {
            PromptMendError::Config(format!(
                "Failed to load pretrained tokenizer {}: {}",
                identifier, e
            ))
        })?;
        Ok(Self {
            tokenizer,
            name: identifier.to_string(),
        })
    }
}

impl TokenEncoder for HfTokenizerEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| PromptMendError::Encoding(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, false)
            .map_err(|e| PromptMendError::Encoding(e.to_string()))
    }
}

/// Build the encoder named by the configuration. Loading a pretrained
/// tokenizer may touch the network, so call this off the async runtime.
pub fn encoder_from_config(config: &TokenizerConfig) -> Result<Arc<dyn TokenEncoder>> {
    let encoder: Arc<dyn TokenEncoder> = match config.source.as_str() {
        "bytes" => Arc::new(ByteLevelEncoder),
        "file" => {
            let path = config.path.as_deref().ok_or_else(|| {
                PromptMendError::Config("tokenizer.path is required for source \"file\"".into())
            })?;
            Arc::new(HfTokenizerEncoder::from_file(path)?)
        }
        "pretrained" => Arc::new(HfTokenizerEncoder::from_pretrained(&config.identifier)?),
        other => {
            return Err(PromptMendError::Config(format!(
                "Unknown tokenizer source: {}",
                other
            )))
        }
    };
    info!("🔤 Token encoder: {}", encoder.name());
    Ok(encoder)
}

/// Token accounting for one request
#[derive(Clone)]
pub struct TokenBudgetManager {
    encoder: Arc<dyn TokenEncoder>,
    max_tokens: usize,
}

impl TokenBudgetManager {
    pub fn new(encoder: Arc<dyn TokenEncoder>, max_tokens: Option<usize>) -> Self {
        Self {
            encoder,
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// `floor(max_tokens * (1 - 0.15))`
    pub fn budget(&self) -> usize {
        self.max_tokens * (100 - SAFETY_MARGIN_PERCENT) / 100
    }

    pub fn remaining(&self, reserved: usize) -> usize {
        self.budget().saturating_sub(reserved)
    }

    pub fn count(&self, text: &str) -> Result<usize> {
        self.encoder.count(text)
    }

    pub fn exceeds_budget(&self, text: &str) -> Result<bool> {
        Ok(self.count(text)? > self.budget())
    }

    pub fn encoder(&self) -> &Arc<dyn TokenEncoder> {
        &self.encoder
    }

    /// Returns `text` unchanged when it fits in `budget() - reserved` tokens,
    /// otherwise the longest decoded prefix that does.
    pub fn truncate_to_fit(&self, text: &str, reserved: usize) -> Result<String> {
        let limit = self.remaining(reserved);
        let tokens = self.encoder.encode(text)?;
        if tokens.len() <= limit {
            return Ok(text.to_string());
        }

        // Decoding a prefix can re-encode longer (merged subwords, repaired
        // characters), so shrink until the round trip fits.
        let mut end = limit;
        loop {
            let candidate = self.encoder.decode(&tokens[..end])?;
            let encoded = self.encoder.count(&candidate)?;
            if encoded <= limit {
                return Ok(candidate);
            }
            if end == 0 {
                return Ok(String::new());
            }
            end = end.saturating_sub((encoded - limit).max(1));
        }
    }
}
