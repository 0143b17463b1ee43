//! Error types for credential storage operations

/// Errors from credential storage and encryption.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("encryption key invalid: {0}")]
    KeyInvalid(String),

    #[error("credential not decryptable: {0}")]
    NotDecryptable(String),

    #[error("state parse error: {0}")]
    StateParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential not found: {0}")]
    NotFound(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
