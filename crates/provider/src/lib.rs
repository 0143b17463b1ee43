//! Provider adapter contract for conversion backends
//!
//! Defines the `ProviderAdapter` trait that decouples the fallback
//! executor from provider SDKs. Adapters own all provider-specific
//! encoding/decoding and surface failures through the fixed
//! `AdapterError` vocabulary; the executor only ever branches on the
//! vocabulary and its `Disposition`, never on provider-native shapes.

pub mod classify;

pub use classify::classify_response;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};

/// Failure vocabulary every adapter maps its provider's errors into.
///
/// The executor decides whether to try the next candidate based on
/// `disposition()`, so a new adapter only has to get this mapping right
/// to participate in fallback correctly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Credential rejected by the provider (revoked key, expired token)
    #[error("provider rejected the credential")]
    Unauthorized,

    /// Provider-side quota for this credential is exhausted
    #[error("provider quota exhausted for this credential")]
    QuotaExceeded,

    /// The provider cannot perform the requested operation
    /// (e.g. a language missing from its OCR locale list)
    #[error("capability not supported: {0}")]
    UnsupportedCapability(String),

    /// Network failure, timeout, rate limit, or provider-side 5xx
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The caller's input is at fault (corrupt, password-protected,
    /// over a hard size limit) — no alternate provider can fix it
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Anything the adapter could not recognize
    #[error("unknown provider error: {0}")]
    Unknown(String),
}

/// Whether the fallback chain should move on or stop after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Try the next candidate in the chain
    Continue,
    /// Stop immediately and surface the error to the caller
    Abort,
}

impl AdapterError {
    /// Classify this failure for the fallback chain.
    ///
    /// Only `InvalidInput` aborts: retrying a different provider against
    /// unfixable input wastes quota. Unrecognized errors continue
    /// optimistically — a degraded-but-successful result beats a hard
    /// failure while candidates remain.
    pub fn disposition(&self) -> Disposition {
        match self {
            AdapterError::InvalidInput(_) => Disposition::Abort,
            AdapterError::Unauthorized
            | AdapterError::QuotaExceeded
            | AdapterError::UnsupportedCapability(_)
            | AdapterError::Transient(_)
            | AdapterError::Unknown(_) => Disposition::Continue,
        }
    }
}

/// One conversion request as seen by an adapter.
#[derive(Debug, Clone)]
pub struct OperationInput {
    /// Operation name, e.g. "pdf-to-word" or "compress"
    pub operation: String,
    /// Raw document bytes
    pub document: Vec<u8>,
    /// Original filename, used for format sniffing and temp files
    pub filename: String,
    pub source_format: Option<String>,
    pub target_format: Option<String>,
    /// ISO language hint for OCR operations, e.g. "vi"
    pub language: Option<String>,
    /// Provider-agnostic extra options passed through to the adapter
    pub options: serde_json::Value,
}

impl OperationInput {
    pub fn new(
        operation: impl Into<String>,
        document: Vec<u8>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            document,
            filename: filename.into(),
            source_format: None,
            target_format: None,
            language: None,
            options: serde_json::Value::Null,
        }
    }
}

/// Adapter output behind a fixed tagged shape, so callers never branch
/// on provider-specific response formats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationOutput {
    /// Extracted or converted text (OCR, pdf-to-text)
    Text { content: String },
    /// A produced document (converted/compressed/watermarked file)
    File { bytes: Vec<u8>, format: String },
    /// Structured provider output (tables, layout trees)
    Structured { value: serde_json::Value },
}

/// Successful invocation: the output plus metered token usage.
///
/// Token counts are zero for providers that don't meter by tokens
/// (local libraries); the usage tracker still records the call.
#[derive(Debug, Clone)]
pub struct AdapterSuccess {
    pub output: OperationOutput,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Static metadata for one fallback candidate, sourced from
/// configuration and surfaced to callers alongside the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    /// Candidate name reported as `technology_used`
    pub name: String,
    /// Credential pool provider this candidate draws from;
    /// `None` means no credential is needed (local library)
    pub provider: Option<String>,
    /// Whether calls are billed against the user's premium quota
    pub premium: bool,
    /// Quality label surfaced to callers ("high", "standard", ...)
    pub quality: String,
    /// Candidate kind ("cloud-api", "llm-vision", "local")
    pub kind: String,
    /// Per-call timeout; cloud document conversion legitimately takes
    /// longer than a vision-OCR call, so this is per-candidate
    pub timeout_secs: u64,
    /// Billing rate per 1,000 usage units, used to derive UsageRecord cost
    pub cost_per_1k: f64,
}

impl CandidateDescriptor {
    pub fn requires_credential(&self) -> bool {
        self.provider.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Result alias for adapter invocations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Abstraction over conversion providers.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn ProviderAdapter>` held by the executor). The secret is the
/// decrypted credential for providers that need one, handed over
/// transiently and never stored by the adapter.
pub trait ProviderAdapter: Send + Sync {
    /// Identifier for logging, matching the candidate name
    fn name(&self) -> &str;

    /// Perform the operation against the provider.
    fn invoke<'a>(
        &'a self,
        secret: Option<&'a Secret<String>>,
        input: &'a OperationInput,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterSuccess>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_aborts() {
        let err = AdapterError::InvalidInput("password-protected PDF".into());
        assert_eq!(err.disposition(), Disposition::Abort);
    }

    #[test]
    fn unauthorized_continues() {
        assert_eq!(
            AdapterError::Unauthorized.disposition(),
            Disposition::Continue
        );
    }

    #[test]
    fn quota_exceeded_continues() {
        assert_eq!(
            AdapterError::QuotaExceeded.disposition(),
            Disposition::Continue
        );
    }

    #[test]
    fn unsupported_capability_continues() {
        let err = AdapterError::UnsupportedCapability("OCR language 'vi'".into());
        assert_eq!(err.disposition(), Disposition::Continue);
    }

    #[test]
    fn transient_continues() {
        let err = AdapterError::Transient("connection reset".into());
        assert_eq!(err.disposition(), Disposition::Continue);
    }

    #[test]
    fn unknown_defaults_to_continue() {
        let err = AdapterError::Unknown("weird response shape".into());
        assert_eq!(err.disposition(), Disposition::Continue);
    }

    #[test]
    fn descriptor_credential_requirement_follows_provider() {
        let mut desc = CandidateDescriptor {
            name: "cloud-doc-api".into(),
            provider: Some("clouddoc".into()),
            premium: true,
            quality: "high".into(),
            kind: "cloud-api".into(),
            timeout_secs: 120,
            cost_per_1k: 0.4,
        };
        assert!(desc.requires_credential());
        desc.provider = None;
        assert!(!desc.requires_credential());
    }

    #[test]
    fn descriptor_timeout_converts_to_duration() {
        let desc = CandidateDescriptor {
            name: "local-library".into(),
            provider: None,
            premium: false,
            quality: "standard".into(),
            kind: "local".into(),
            timeout_secs: 30,
            cost_per_1k: 0.0,
        };
        assert_eq!(desc.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn output_serializes_tagged() {
        let out = OperationOutput::Text {
            content: "extracted".into(),
        };
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains("\"type\":\"text\""));

        let out = OperationOutput::Structured {
            value: serde_json::json!({"pages": 3}),
        };
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains("\"type\":\"structured\""));
    }

    #[test]
    fn error_display_never_empty() {
        for err in [
            AdapterError::Unauthorized,
            AdapterError::QuotaExceeded,
            AdapterError::UnsupportedCapability("x".into()),
            AdapterError::Transient("x".into()),
            AdapterError::InvalidInput("x".into()),
            AdapterError::Unknown("x".into()),
        ] {
            assert!(!err.to_string().is_empty());
        }
    }
}
