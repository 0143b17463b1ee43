//! Per-user premium operation quota guard
//!
//! A provider-agnostic gate on how many premium conversions an owner
//! may run per billing period, independent of which credential serves
//! them. Reservation is optimistic (reserve before the call, release on
//! chain failure) so concurrent bursts cannot overshoot the limit.

pub mod error;
pub mod guard;

pub use error::{Error, Result};
pub use guard::{QuotaGuard, QuotaSnapshot, Subscription, SubscriptionStatus};
