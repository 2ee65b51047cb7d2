//! Rosterd Error Types

use thiserror::Error;

/// Result type alias for rosterd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Rosterd error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Directory store errors
    #[error("Directory store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    // Address resolution errors
    #[error("Name resolution failed for '{0}': {1}")]
    Resolve(String, String),

    #[error("Name resolution for '{name}' exhausted after {attempts} attempts")]
    ResolveExhausted { name: String, attempts: u32 },

    #[error("'{0}' resolved only to unroutable addresses")]
    NoRoutableAddress(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::DirectoryUnavailable(_) | Error::Network(_)
        )
    }

    /// Check if this error must terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ResolveExhausted { .. } | Error::NoRoutableAddress(_) | Error::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let store_err = Error::DirectoryUnavailable("connection refused".into());
        assert!(store_err.is_retryable());
        assert!(!store_err.is_fatal());

        let exhausted = Error::ResolveExhausted {
            name: "keycloak-2".into(),
            attempts: 30,
        };
        assert!(!exhausted.is_retryable());
        assert!(exhausted.is_fatal());
    }
}
