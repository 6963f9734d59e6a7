use crate::extract::extract_json;
use serde_json::Value;

/// Output of one LLM step: either structured data or the raw text that
/// could not be parsed. Malformed output is recorded, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedStep<T> {
    Structured(T),
    Malformed(String),
}

impl<T> ParsedStep<T> {
    pub fn is_malformed(&self) -> bool {
        matches!(self, ParsedStep::Malformed(_))
    }

    pub fn structured(&self) -> Option<&T> {
        match self {
            ParsedStep::Structured(value) => Some(value),
            ParsedStep::Malformed(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParsedStep<U> {
        match self {
            ParsedStep::Structured(value) => ParsedStep::Structured(f(value)),
            ParsedStep::Malformed(raw) => ParsedStep::Malformed(raw),
        }
    }
}

/// Extract and parse the JSON payload of a completion
pub fn parse_completion(raw: &str) -> ParsedStep<Value> {
    match serde_json::from_str(&extract_json(raw)) {
        Ok(value) => ParsedStep::Structured(value),
        Err(_) => ParsedStep::Malformed(raw.to_string()),
    }
}
