//! Encrypted credential storage library
//!
//! Owns the persisted records of provider credentials: the encrypted
//! secret, per-period quota windows, the usage audit log, and rotation
//! events. This crate is a standalone library with no dependency on the
//! orchestrator binary — it can be tested and used independently.
//!
//! Credential flow:
//! 1. Admin creates a credential via `CredentialStore::add()` (secret
//!    encrypted with `SecretCipher` before it touches disk)
//! 2. The pool selects records via `by_provider()` snapshots and
//!    decrypts on demand with `decrypt_secret()`
//! 3. Completed calls land via `apply_usage()`; hand-offs via
//!    `apply_rotation()`
//! 4. A background sweep calls `reset_due()` at period boundaries

pub mod cipher;
pub mod error;
pub mod store;
pub mod types;

pub use cipher::{KEK_ENV_VAR, SecretCipher};
pub use error::{Error, Result};
pub use store::{CredentialStore, ResetSummary};
pub use types::{
    CredentialRecord, CredentialStatus, NewCredential, PeriodKind, QuotaWindow, RotationEvent,
    RotationReason, UsageOutcome, UsageRecord, now_millis,
};
