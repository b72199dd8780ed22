//! Error types for Chatrelay

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("access token is invalid: {0}")]
    TokenInvalid(String),

    #[error("identity lookup failed: {0}")]
    IdentityLookup(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn token_invalid(reason: impl Into<String>) -> Self {
        Self::TokenInvalid(reason.into())
    }

    pub fn identity_lookup(reason: impl Into<String>) -> Self {
        Self::IdentityLookup(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError(reason.into())
    }

    /// Auth failures leave the connection open so the client can retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TokenInvalid(_) | Self::IdentityLookup(_) | Self::InvalidMessage(_))
    }
}
