//! Error types for the user quota guard

/// Errors from quota guard operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The owner's premium allowance for this billing period is spent.
    /// Expected and UX-actionable — carries what the caller needs to
    /// render an upgrade prompt. Never a system error.
    #[error("premium operation limit reached ({used}/{limit}): {suggestion}")]
    QuotaExceeded {
        limit: u64,
        used: u64,
        /// Days until the period resets; `None` when no reset is scheduled
        resets_in_days: Option<u64>,
        /// Plan name when a subscription was resolved
        plan: Option<String>,
        /// Human-readable next step for the user
        suggestion: String,
    },

    #[error("state parse error: {0}")]
    StateParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for guard operations.
pub type Result<T> = std::result::Result<T, Error>;
