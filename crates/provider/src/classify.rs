//! HTTP response classification for remote adapters
//!
//! Maps status codes and response bodies from HTTP-backed providers
//! into the `AdapterError` vocabulary. Distinguishes credential quota
//! exhaustion (429 with an exhaustion message) from transient rate
//! limits (429 with a generic message) — only the former should retire
//! the credential.

use crate::AdapterError;

/// Quota exhaustion message patterns in provider 429 responses.
///
/// These indicate the credential's plan allowance is spent, not a
/// transient per-minute rate limit.
const QUOTA_PATTERNS: &[&str] = &[
    "quota exceeded",
    "credits exhausted",
    "insufficient credits",
    "monthly limit",
    "usage limit for your plan",
    "subscription usage limit",
];

/// Input rejection patterns in provider 400 responses.
///
/// Providers report unreadable documents in the 400 body; these phrases
/// mark the input itself (not the request encoding) as the problem.
const INVALID_INPUT_PATTERNS: &[&str] = &[
    "password",
    "encrypted",
    "corrupt",
    "unreadable",
    "not a valid",
    "page limit",
];

/// Classify a 429 response body as quota exhaustion or transient rate limit.
fn classify_429(body: &str) -> AdapterError {
    let lower = body.to_lowercase();
    for pattern in QUOTA_PATTERNS {
        if lower.contains(pattern) {
            return AdapterError::QuotaExceeded;
        }
    }
    AdapterError::Transient(format!("rate limited: {}", truncate(body)))
}

/// Classify a 400 response body as an input fault or an unknown error.
fn classify_400(body: &str) -> AdapterError {
    let lower = body.to_lowercase();
    for pattern in INVALID_INPUT_PATTERNS {
        if lower.contains(pattern) {
            return AdapterError::InvalidInput(truncate(body));
        }
    }
    AdapterError::Unknown(format!("provider returned 400: {}", truncate(body)))
}

/// Map an HTTP status and response body to an `AdapterError`.
///
/// Fixed table:
/// - 401/403 → Unauthorized (credential revoked or invalid)
/// - 429 → body-sniffed QuotaExceeded vs Transient
/// - 400 → body-sniffed InvalidInput vs Unknown
/// - 413 → InvalidInput (hard size limit)
/// - 415/501 → UnsupportedCapability
/// - 422 → InvalidInput
/// - 408/5xx → Transient
/// - everything else → Unknown
pub fn classify_response(status: u16, body: &str) -> AdapterError {
    match status {
        401 | 403 => AdapterError::Unauthorized,
        429 => classify_429(body),
        400 => classify_400(body),
        413 => AdapterError::InvalidInput(format!("document exceeds size limit: {}", truncate(body))),
        422 => AdapterError::InvalidInput(truncate(body)),
        415 | 501 => AdapterError::UnsupportedCapability(truncate(body)),
        408 | 500 | 502 | 503 | 504 => {
            AdapterError::Transient(format!("upstream {status}: {}", truncate(body)))
        }
        _ => AdapterError::Unknown(format!("unexpected status {status}: {}", truncate(body))),
    }
}

/// Cap body excerpts carried inside error details.
fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}
