//! Credential pool for conversion providers
//!
//! Manages multiple provider credentials with priority-ordered
//! selection, quota-aware rotation, usage metering, and a periodic
//! reset sweep. The pool reads records from `credential-store` (single
//! source of truth) and layers selection and rotation policy on top.
//!
//! Credential lifecycle:
//! 1. Admin adds a credential via the admin API → status `Active`
//! 2. `select` returns the best usable credential with its decrypted secret
//! 3. Completed calls land via `track_usage`; crossing the preemptive
//!    headroom threshold retires the credential before it drains
//! 4. Provider-reported exhaustion/revocation triggers `rotate`
//! 5. The reset sweep reopens due quota windows and reactivates
//!    `QuotaExceeded` credentials (`Revoked` is terminal)

pub mod error;
pub mod pool;
pub mod reset;

pub use error::{Error, Result};
pub use pool::{CredentialPool, PoolConfig, SelectedCredential};
pub use reset::spawn_reset_task;
