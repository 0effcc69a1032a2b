use crate::domain::session::SessionError;
use crate::providers::bedrock::auth::SigningError;
use thiserror::Error;

/// llm-proxy application error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Session store error: {0}")]
    Session(#[from] SessionError),

    #[error("Bedrock setup error: {0}")]
    Bedrock(#[from] SigningError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid setting {field}: {message}")]
    InvalidSetting { field: String, message: String },
}

impl Error {
    pub fn invalid_setting(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
