//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every credential for the provider is exhausted or revoked.
    /// Operator-actionable: capacity must be added. The fallback chain
    /// treats this as recoverable (next candidate), but it is never a
    /// generic failure.
    #[error("no credential available for provider {provider}: {detail}")]
    NoCredentialAvailable { provider: String, detail: String },

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential store error: {0}")]
    Store(String),
}

impl From<credential_store::Error> for Error {
    fn from(err: credential_store::Error) -> Self {
        match err {
            credential_store::Error::NotFound(id) => Error::NotFound(id),
            other => Error::Store(other.to_string()),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
