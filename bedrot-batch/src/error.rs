//! Application-wide error types.

use std::path::Path;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// A required credential, binary or parameter is missing.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An external tool or API reported failure.
    #[error("{tool} failed{}: {detail}", describe_exit(.code))]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("Duplicate job id: {0}")]
    DuplicateId(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {}", code),
        None => String::new(),
    }
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn external(tool: impl Into<String>, code: Option<i32>, detail: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            code,
            detail: detail.into(),
        }
    }

    /// An `Io` error for an input that does not exist.
    pub fn missing_file(what: &str, path: &Path) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found: {}", what, path.display()),
        ))
    }

    /// Whether a stage may be attempted again after this error.
    ///
    /// Only external tool failures qualify; configuration, IO and validation
    /// problems fail fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalTool { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short category name used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::ExternalTool { .. } => "external_tool",
            Self::Io(_) => "io",
            Self::Cancelled => "cancelled",
            Self::DuplicateId(_) => "duplicate_id",
            Self::NotFound { .. } => "not_found",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::Validation(_) => "validation",
            Self::Serialization(_) => "serialization",
            Self::Http(_) => "http",
            Self::Other(_) => "other",
        }
    }
}
