//! Error types for Safebox

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SafeboxError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Store is not initialized; call initialize first")]
    NotInitialized,

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Storage transaction failed: {0}")]
    StorageTransaction(#[from] sqlx::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl SafeboxError {
    /// True for authentication/integrity failures on decrypt.
    pub fn is_decryption(&self) -> bool {
        matches!(self, SafeboxError::Decryption(_))
    }
}

pub type Result<T> = std::result::Result<T, SafeboxError>;
