//! Error types for the piped agent

use thiserror::Error;

/// Main error type for the piped agent
#[derive(Error, Debug)]
pub enum PipedError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Git error: {0}")]
    GitError(String),

    #[error("Plan error: {0}")]
    PlanError(String),

    #[error("Deploy error: {0}")]
    DeployError(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Notifier error: {0}")]
    NotifierError(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Secret error: {0}")]
    SecretError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for PipedError {
    fn from(err: anyhow::Error) -> Self {
        PipedError::Internal(err.to_string())
    }
}

impl PipedError {
    /// Whether the error is the expected-absence sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PipedError::NotFound(_))
    }
}
