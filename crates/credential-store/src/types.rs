//! Persisted record types for the credential pool
//!
//! Timestamps are unix milliseconds (absolute), computed from
//! `SystemTime` at mutation time. Quota windows keep `remaining`
//! denormalized so selection can order on it without arithmetic; every
//! mutation reestablishes `remaining == limit - used`.

use serde::{Deserialize, Serialize};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle status of a credential.
///
/// Transitions:
/// - Active → QuotaExceeded (usage crossed the preemptive threshold, or
///   the provider reported exhaustion)
/// - QuotaExceeded → Active (monthly window reset)
/// - Active → Revoked (provider rejected the credential, or admin action)
///
/// Revoked is terminal: no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    QuotaExceeded,
    Revoked,
}

impl CredentialStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::QuotaExceeded => "quota_exceeded",
            CredentialStatus::Revoked => "revoked",
        }
    }
}

/// Quota window cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    Monthly,
    Daily,
}

impl PeriodKind {
    /// Fixed window length in milliseconds (30 days / 24 hours).
    pub fn length_millis(&self) -> u64 {
        match self {
            PeriodKind::Monthly => 30 * 24 * 60 * 60 * 1000,
            PeriodKind::Daily => 24 * 60 * 60 * 1000,
        }
    }
}

/// One usage counter scoped to a credential and a period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub limit: u64,
    pub used: u64,
    /// Denormalized `limit - used`, kept for fast selection ordering
    pub remaining: u64,
    /// Unix millis when this window resets
    pub reset_at: u64,
}

impl QuotaWindow {
    /// Fresh window starting now.
    pub fn new(kind: PeriodKind, limit: u64, now: u64) -> Self {
        Self {
            limit,
            used: 0,
            remaining: limit,
            reset_at: now + kind.length_millis(),
        }
    }

    /// Record usage against this window.
    pub fn consume(&mut self, delta: u64) {
        self.used = self.used.saturating_add(delta);
        self.remaining = self.limit.saturating_sub(self.used);
    }

    /// Whether the window's reset time has passed.
    pub fn is_due(&self, now: u64) -> bool {
        self.reset_at <= now
    }

    /// Zero the counter and advance `reset_at` past `now` by whole periods.
    pub fn reset(&mut self, kind: PeriodKind, now: u64) {
        self.used = 0;
        self.remaining = self.limit;
        while self.reset_at <= now {
            self.reset_at += kind.length_millis();
        }
    }
}

/// One managed provider credential with its embedded quota windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub name: String,
    pub provider: String,
    /// Encrypted secret blob (`v1:` + base64); plaintext never persisted
    pub secret: String,
    pub status: CredentialStatus,
    /// Lower priority is tried first
    pub priority: u32,
    /// Unix millis of the last metered use; `None` until first use
    pub last_used_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub monthly: QuotaWindow,
    pub daily: QuotaWindow,
}

impl CredentialRecord {
    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }
}

/// Parameters for creating a credential (admin action).
///
/// The plaintext secret only lives in this struct transiently; the
/// store encrypts it before persisting.
pub struct NewCredential {
    pub name: String,
    pub provider: String,
    pub secret: common::Secret<String>,
    pub priority: u32,
    pub monthly_limit: u64,
    /// Defaults to `monthly_limit / 30` when not set
    pub daily_limit: Option<u64>,
    pub notes: Option<String>,
}

/// Outcome recorded on a usage audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    Error,
}

/// Immutable audit/billing line for one provider call attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub credential_id: String,
    pub at: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Derived by the caller from the winning candidate's unit rate
    pub cost: f64,
    pub outcome: UsageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Why a credential was rotated away from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationReason {
    QuotaExceeded,
    Revoked,
    Error,
}

impl RotationReason {
    pub fn label(&self) -> &'static str {
        match self {
            RotationReason::QuotaExceeded => "quota-exceeded",
            RotationReason::Revoked => "revoked",
            RotationReason::Error => "error",
        }
    }
}

/// Immutable record of a credential hand-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationEvent {
    pub from: String,
    /// `None` when no replacement was available — the alert-worthy case
    pub to: Option<String>,
    pub reason: RotationReason,
    pub actor: String,
    pub at: u64,
}
