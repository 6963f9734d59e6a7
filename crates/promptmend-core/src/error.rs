use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PromptMendError {
    #[error("Invalid request: {0}")]
    Request(String),

    #[error("LLM service error: {0}")]
    Service(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Schema violation: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Modification #{index} could not be applied: {reason}")]
    PatchApplication { index: usize, reason: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PromptMendError>;

/// Serializable error category, used wherever an error has to outlive the
/// call that produced it (pipeline state, cached results, CLI output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Request,
    Service,
    Parse,
    Schema,
    PatchApplication,
    Encoding,
    Timeout,
    Cache,
    Config,
    Io,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Request => "request",
            ErrorKind::Service => "service",
            ErrorKind::Parse => "parse",
            ErrorKind::Schema => "schema",
            ErrorKind::PatchApplication => "patch_application",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cache => "cache",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PromptMendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PromptMendError::Request(_) => ErrorKind::Request,
            PromptMendError::Service(_) => ErrorKind::Service,
            PromptMendError::Parse(_) => ErrorKind::Parse,
            PromptMendError::Schema(_) => ErrorKind::Schema,
            PromptMendError::PatchApplication { .. } => ErrorKind::PatchApplication,
            PromptMendError::Encoding(_) => ErrorKind::Encoding,
            PromptMendError::Timeout(_) => ErrorKind::Timeout,
            PromptMendError::Cache(_) => ErrorKind::Cache,
            PromptMendError::Config(_) => ErrorKind::Config,
            PromptMendError::Io(_) => ErrorKind::Io,
            PromptMendError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Fatal errors end the request immediately instead of consuming an
    /// iteration of the repair loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PromptMendError::Request(_) | PromptMendError::Encoding(_) | PromptMendError::Config(_)
        )
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured error payload carried in results and printed by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PromptMendError> for ErrorReport {
    fn from(err: &PromptMendError) -> Self {
        err.report()
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
