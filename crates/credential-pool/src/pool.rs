//! Credential selection, rotation, and usage tracking
//!
//! The pool is policy over the credential store: it decides which
//! credential serves the next call, retires exhausted or revoked
//! credentials, and meters usage. The store remains the single source
//! of truth; selection reads a snapshot and holds no lock across any
//! store I/O.
//!
//! Credential lifecycle:
//! 1. Admin adds a credential → status `Active`
//! 2. `select` orders usable credentials by priority, monthly headroom,
//!    and idleness, and decrypts the winner's secret in memory
//! 3. Usage lands via `track_usage`; when monthly headroom drops below
//!    the preemptive fraction the credential is rotated away before it
//!    drains mid-call
//! 4. Provider-reported revocation or exhaustion triggers `rotate`
//! 5. The periodic reset sweep reopens quota windows and reactivates
//!    `QuotaExceeded` credentials; `Revoked` is terminal

use std::sync::Arc;

use common::Secret;
use credential_store::{
    CredentialRecord, CredentialStatus, CredentialStore, ResetSummary, RotationEvent,
    RotationReason, UsageOutcome, now_millis,
};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Tunable selection and rotation thresholds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum monthly `remaining` for normal selection
    pub safety_threshold: u64,
    /// Monthly headroom fraction below which a credential is
    /// preemptively rotated after usage lands
    pub preemptive_fraction: f64,
    /// How close a quota reset must be for the relaxed selection pass
    pub reset_horizon_millis: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            safety_threshold: 10_000,
            preemptive_fraction: 0.05,
            reset_horizon_millis: 60 * 60 * 1000,
        }
    }
}

/// A selected credential with its decrypted secret, ready for a call.
///
/// The secret exists only in this value; it is never persisted or
/// logged (`Secret` redacts it).
#[derive(Debug)]
pub struct SelectedCredential {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub secret: Secret<String>,
}

/// Credential pool: selection and rotation policy over the store.
pub struct CredentialPool {
    store: Arc<CredentialStore>,
    config: PoolConfig,
}

impl CredentialPool {
    pub fn new(store: Arc<CredentialStore>, config: PoolConfig) -> Self {
        Self { store, config }
    }

    /// Get the credential store reference (for admin handlers and the
    /// reset task).
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Select the best usable credential for a provider.
    ///
    /// Ordering: priority ascending, then monthly `remaining`
    /// descending, then `last_used_at` ascending with never-used
    /// credentials first (load-balances across idle credentials).
    ///
    /// Credentials below the safety threshold are excluded unless their
    /// monthly reset is within the configured horizon — a call can
    /// still be attempted just before the window reopens.
    ///
    /// Selection is read-only; `last_used_at` moves only when usage
    /// actually lands. Two concurrent selections may return the same
    /// credential; quota accounting stays correct because
    /// `track_usage` applies true deltas.
    pub async fn select(&self, provider: &str) -> Result<SelectedCredential> {
        let records = self.store.by_provider(provider).await;
        let now = now_millis();

        let mut eligible: Vec<&CredentialRecord> = records
            .iter()
            .filter(|c| c.is_active() && c.monthly.remaining > self.config.safety_threshold)
            .collect();

        if eligible.is_empty() {
            eligible = records
                .iter()
                .filter(|c| {
                    c.is_active() && c.monthly.reset_at <= now + self.config.reset_horizon_millis
                })
                .collect();
            if !eligible.is_empty() {
                debug!(provider, "selection relaxed to credentials near quota reset");
            }
        }

        eligible.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.monthly.remaining.cmp(&a.monthly.remaining))
                .then_with(|| match (a.last_used_at, b.last_used_at) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(x), Some(y)) => x.cmp(&y),
                })
        });

        for candidate in &eligible {
            match self.store.decrypt_secret(&candidate.id).await {
                Ok(secret) => {
                    return Ok(SelectedCredential {
                        id: candidate.id.clone(),
                        name: candidate.name.clone(),
                        provider: candidate.provider.clone(),
                        secret,
                    });
                }
                Err(credential_store::Error::NotDecryptable(msg)) => {
                    warn!(
                        credential_id = candidate.id,
                        error = %msg,
                        "credential not decryptable, skipping"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        metrics::counter!("credential_pool_exhausted_total", "provider" => provider.to_string())
            .increment(1);
        Err(Error::NoCredentialAvailable {
            provider: provider.to_string(),
            detail: exhausted_detail(&records),
        })
    }

    /// Retire a credential and select its replacement.
    ///
    /// `QuotaExceeded` is recoverable at the next period reset;
    /// `Revoked` and `Error` are terminal. A `RotationEvent` is
    /// recorded whether or not a replacement exists. `Ok(None)` means
    /// the provider has no remaining capacity — the caller is told
    /// explicitly so an operator can act.
    pub async fn rotate(
        &self,
        credential_id: &str,
        reason: RotationReason,
        actor: &str,
    ) -> Result<Option<SelectedCredential>> {
        let record = self
            .store
            .get(credential_id)
            .await
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;

        let new_status = match reason {
            RotationReason::QuotaExceeded => CredentialStatus::QuotaExceeded,
            RotationReason::Revoked | RotationReason::Error => CredentialStatus::Revoked,
        };

        // Flip first so re-selection can't hand the same credential back
        self.store.set_status(credential_id, new_status).await?;

        let replacement = match self.select(&record.provider).await {
            Ok(s) => Some(s),
            Err(Error::NoCredentialAvailable { .. }) => None,
            Err(e) => return Err(e),
        };

        let event = RotationEvent {
            from: credential_id.to_string(),
            to: replacement.as_ref().map(|s| s.id.clone()),
            reason,
            actor: actor.to_string(),
            at: now_millis(),
        };
        self.store
            .apply_rotation(credential_id, new_status, event)
            .await?;

        metrics::counter!(
            "credential_rotations_total",
            "provider" => record.provider.clone(),
            "reason" => reason.label()
        )
        .increment(1);

        match &replacement {
            Some(s) => info!(
                from = credential_id,
                to = s.id,
                provider = record.provider,
                reason = reason.label(),
                "credential rotated"
            ),
            None => error!(
                credential_id,
                provider = record.provider,
                reason = reason.label(),
                "credential rotated with no replacement — provider capacity exhausted, operator action required"
            ),
        }

        Ok(replacement)
    }

    /// Record a completed call's usage against a credential.
    ///
    /// Updates both quota windows and the audit log, then checks the
    /// preemptive threshold: a credential whose monthly headroom fell
    /// below `preemptive_fraction` of its limit is rotated away now,
    /// not on the next request's mid-call failure. A missing
    /// replacement is logged loudly by `rotate` but does not fail the
    /// already-successful call.
    pub async fn track_usage(
        &self,
        credential_id: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
    ) -> Result<()> {
        let monthly = self
            .store
            .apply_usage(
                credential_id,
                tokens_in,
                tokens_out,
                cost,
                UsageOutcome::Success,
                None,
            )
            .await?;

        let floor = (monthly.limit as f64 * self.config.preemptive_fraction) as u64;
        if monthly.remaining < floor {
            info!(
                credential_id,
                remaining = monthly.remaining,
                floor,
                "monthly headroom below preemptive threshold, rotating"
            );
            self.rotate(credential_id, RotationReason::QuotaExceeded, "usage-tracker")
                .await?;
        }
        Ok(())
    }

    /// Record a failed call attempt (audit line only, no quota delta).
    pub async fn record_failure(&self, credential_id: &str, detail: String) -> Result<()> {
        self.store
            .apply_usage(credential_id, 0, 0, 0.0, UsageOutcome::Error, Some(detail))
            .await?;
        Ok(())
    }

    /// Reset every due quota window and reactivate `QuotaExceeded`
    /// credentials whose monthly window reopened.
    pub async fn run_reset(&self, now: u64) -> Result<ResetSummary> {
        let summary = self.store.reset_due(now).await?;
        for id in &summary.reactivated {
            info!(credential_id = %id, "quota window reset, credential active again");
        }
        if summary.windows_reset > 0 {
            debug!(windows = summary.windows_reset, "quota reset sweep completed");
        }
        Ok(summary)
    }

    /// Pool health summary for the admin endpoint.
    ///
    /// Status mapping: all credentials active → healthy, some active →
    /// degraded, none active → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let records = self.store.list().await;

        let mut credentials = Vec::new();
        let mut active = 0usize;
        let mut quota_exceeded = 0usize;
        let mut revoked = 0usize;

        for record in &records {
            match record.status {
                CredentialStatus::Active => active += 1,
                CredentialStatus::QuotaExceeded => quota_exceeded += 1,
                CredentialStatus::Revoked => revoked += 1,
            }
            credentials.push(serde_json::json!({
                "id": record.id,
                "name": record.name,
                "provider": record.provider,
                "status": record.status.label(),
                "priority": record.priority,
                "monthly_remaining": record.monthly.remaining,
                "monthly_reset_at": record.monthly.reset_at,
            }));
        }

        let total = records.len();
        let status = if active == total && total > 0 {
            "healthy"
        } else if active > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": total,
            "credentials_active": active,
            "credentials_quota_exceeded": quota_exceeded,
            "credentials_revoked": revoked,
            "credentials": credentials,
        })
    }
}

/// Build the exhausted error detail with per-status counts.
fn exhausted_detail(records: &[CredentialRecord]) -> String {
    let active = records.iter().filter(|c| c.is_active()).count();
    let quota_exceeded = records
        .iter()
        .filter(|c| c.status == CredentialStatus::QuotaExceeded)
        .count();
    let revoked = records
        .iter()
        .filter(|c| c.status == CredentialStatus::Revoked)
        .count();
    format!(
        "{} credentials: {active} active, {quota_exceeded} quota_exceeded, {revoked} revoked",
        records.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use credential_store::{NewCredential, PeriodKind, SecretCipher};

    async fn test_store(dir: &tempfile::TempDir) -> Arc<CredentialStore> {
        let path = dir.path().join("pool-state.json");
        Arc::new(
            CredentialStore::load(path, SecretCipher::from_key([5u8; 32]))
                .await
                .unwrap(),
        )
    }

    fn low_threshold_config() -> PoolConfig {
        PoolConfig {
            safety_threshold: 10,
            ..PoolConfig::default()
        }
    }

    async fn add_credential(
        store: &CredentialStore,
        name: &str,
        provider: &str,
        priority: u32,
        monthly_limit: u64,
    ) -> String {
        store
            .add(NewCredential {
                name: name.into(),
                provider: provider.into(),
                secret: Secret::new(format!("sk_{name}")),
                priority,
                monthly_limit,
                daily_limit: None,
                notes: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn select_orders_priority_then_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = add_credential(&store, "a", "clouddoc", 1, 100).await;
        let b = add_credential(&store, "b", "clouddoc", 1, 500).await;
        let c = add_credential(&store, "c", "clouddoc", 2, 1000).await;
        let pool = CredentialPool::new(store.clone(), low_threshold_config());

        // B: same priority as A but more remaining
        let first = pool.select("clouddoc").await.unwrap();
        assert_eq!(first.id, b);

        store
            .set_status(&b, CredentialStatus::Revoked)
            .await
            .unwrap();
        let second = pool.select("clouddoc").await.unwrap();
        assert_eq!(
            second.id, a,
            "priority 1 beats priority 2 despite less remaining"
        );

        store
            .set_status(&a, CredentialStatus::Revoked)
            .await
            .unwrap();
        let third = pool.select("clouddoc").await.unwrap();
        assert_eq!(third.id, c);
    }

    #[tokio::test]
    async fn select_prefers_never_used_on_tie() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let used = add_credential(&store, "used", "clouddoc", 1, 500).await;
        let idle = add_credential(&store, "idle", "clouddoc", 1, 500).await;
        // Zero-delta usage stamps last_used_at without moving the counters
        store
            .apply_usage(&used, 0, 0, 0.0, UsageOutcome::Success, None)
            .await
            .unwrap();
        let pool = CredentialPool::new(store, low_threshold_config());

        let selected = pool.select("clouddoc").await.unwrap();
        assert_eq!(selected.id, idle, "never-used credential wins the tie");
    }

    #[tokio::test]
    async fn select_never_returns_unusable_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let active = add_credential(&store, "active", "clouddoc", 2, 500).await;
        let exhausted = add_credential(&store, "exhausted", "clouddoc", 1, 500).await;
        let revoked = add_credential(&store, "revoked", "clouddoc", 1, 500).await;
        store
            .set_status(&exhausted, CredentialStatus::QuotaExceeded)
            .await
            .unwrap();
        store
            .set_status(&revoked, CredentialStatus::Revoked)
            .await
            .unwrap();
        let pool = CredentialPool::new(store, low_threshold_config());

        for _ in 0..5 {
            let selected = pool.select("clouddoc").await.unwrap();
            assert_eq!(selected.id, active);
        }
    }

    #[tokio::test]
    async fn select_requires_safety_headroom() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        // Limit below the default 10,000 threshold and reset a month away
        add_credential(&store, "small", "clouddoc", 1, 100).await;
        let pool = CredentialPool::new(store, PoolConfig::default());

        let err = pool.select("clouddoc").await.unwrap_err();
        assert!(
            matches!(err, Error::NoCredentialAvailable { .. }),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn select_relaxes_threshold_near_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        add_credential(&store, "small", "clouddoc", 1, 100).await;
        // Horizon wider than the monthly window, so the fresh window's
        // reset_at (30 days out) counts as "near"
        let pool = CredentialPool::new(
            store,
            PoolConfig {
                reset_horizon_millis: 40 * PeriodKind::Daily.length_millis(),
                ..PoolConfig::default()
            },
        );

        let selected = pool.select("clouddoc").await.unwrap();
        assert_eq!(selected.name, "small");
    }

    #[tokio::test]
    async fn select_empty_provider_is_no_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let pool = CredentialPool::new(store, PoolConfig::default());

        let err = pool.select("clouddoc").await.unwrap_err();
        match err {
            Error::NoCredentialAvailable { provider, .. } => assert_eq!(provider, "clouddoc"),
            other => panic!("expected NoCredentialAvailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn select_returns_decrypted_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        add_credential(&store, "main", "clouddoc", 1, 500).await;
        let pool = CredentialPool::new(store, low_threshold_config());

        let selected = pool.select("clouddoc").await.unwrap();
        assert_eq!(selected.secret.expose(), "sk_main");
    }

    #[tokio::test]
    async fn rotate_quota_exceeded_selects_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = add_credential(&store, "a", "clouddoc", 1, 500).await;
        let b = add_credential(&store, "b", "clouddoc", 2, 500).await;
        let pool = CredentialPool::new(store.clone(), low_threshold_config());

        let replacement = pool
            .rotate(&a, RotationReason::QuotaExceeded, "test")
            .await
            .unwrap();
        assert_eq!(replacement.unwrap().id, b);
        assert_eq!(
            store.get(&a).await.unwrap().status,
            CredentialStatus::QuotaExceeded
        );

        let events = store.rotation_events(10).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from, a);
        assert_eq!(events[0].to.as_deref(), Some(b.as_str()));
        assert_eq!(events[0].reason, RotationReason::QuotaExceeded);
    }

    #[tokio::test]
    async fn rotate_revoked_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = add_credential(&store, "a", "clouddoc", 1, 500).await;
        let pool = CredentialPool::new(store.clone(), low_threshold_config());

        pool.rotate(&a, RotationReason::Revoked, "admin")
            .await
            .unwrap();
        assert_eq!(
            store.get(&a).await.unwrap().status,
            CredentialStatus::Revoked
        );

        // A reset sweep far in the future must not reactivate it
        let later = now_millis() + 2 * PeriodKind::Monthly.length_millis();
        pool.run_reset(later).await.unwrap();
        assert_eq!(
            store.get(&a).await.unwrap().status,
            CredentialStatus::Revoked
        );
    }

    #[tokio::test]
    async fn rotate_without_replacement_records_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let only = add_credential(&store, "only", "clouddoc", 1, 500).await;
        let pool = CredentialPool::new(store.clone(), low_threshold_config());

        let replacement = pool
            .rotate(&only, RotationReason::Revoked, "system")
            .await
            .unwrap();
        assert!(replacement.is_none(), "no replacement exists");

        let events = store.rotation_events(10).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].to.is_none());
    }

    #[tokio::test]
    async fn rotate_unknown_credential_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let pool = CredentialPool::new(store, low_threshold_config());

        let err = pool
            .rotate("nonexistent", RotationReason::Error, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn track_usage_maintains_quota_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let id = add_credential(&store, "a", "clouddoc", 1, 100_000).await;
        let pool = CredentialPool::new(store.clone(), PoolConfig::default());

        pool.track_usage(&id, 1_500, 500, 0.8).await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.monthly.used, 2_000);
        assert_eq!(
            record.monthly.remaining,
            record.monthly.limit - record.monthly.used
        );
        assert_eq!(record.daily.used, 2_000);
        assert_eq!(
            record.daily.remaining,
            record.daily.limit - record.daily.used
        );
    }

    #[tokio::test]
    async fn track_usage_rotates_preemptively_below_five_percent() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let id = add_credential(&store, "a", "clouddoc", 1, 100_000).await;
        let pool = CredentialPool::new(
            store.clone(),
            PoolConfig {
                safety_threshold: 100,
                ..PoolConfig::default()
            },
        );

        // Burn to 4% headroom in one call: 96,000 of 100,000
        pool.track_usage(&id, 48_000, 48_000, 38.4).await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, CredentialStatus::QuotaExceeded);
        assert!(
            matches!(
                pool.select("clouddoc").await.unwrap_err(),
                Error::NoCredentialAvailable { .. }
            ),
            "preemptively rotated credential must not be selectable"
        );
    }

    #[tokio::test]
    async fn track_usage_above_threshold_keeps_credential_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let id = add_credential(&store, "a", "clouddoc", 1, 100_000).await;
        let pool = CredentialPool::new(store.clone(), PoolConfig::default());

        pool.track_usage(&id, 10_000, 10_000, 8.0).await.unwrap();

        assert_eq!(
            store.get(&id).await.unwrap().status,
            CredentialStatus::Active
        );
    }

    #[tokio::test]
    async fn reset_restores_selectability() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let id = add_credential(&store, "a", "clouddoc", 1, 100_000).await;
        let pool = CredentialPool::new(
            store.clone(),
            PoolConfig {
                safety_threshold: 100,
                ..PoolConfig::default()
            },
        );

        pool.track_usage(&id, 48_000, 48_000, 38.4).await.unwrap();
        assert!(pool.select("clouddoc").await.is_err());

        let later = now_millis() + 2 * PeriodKind::Monthly.length_millis();
        let summary = pool.run_reset(later).await.unwrap();
        assert_eq!(summary.reactivated, vec![id.clone()]);

        let selected = pool.select("clouddoc").await.unwrap();
        assert_eq!(selected.id, id);
    }

    #[tokio::test]
    async fn record_failure_skips_quota_delta() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let id = add_credential(&store, "a", "clouddoc", 1, 100_000).await;
        let pool = CredentialPool::new(store.clone(), PoolConfig::default());

        pool.record_failure(&id, "upstream 503".into())
            .await
            .unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.monthly.used, 0);
        let usage = store.usage_records(10).await;
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].outcome, UsageOutcome::Error);
        assert_eq!(usage[0].detail.as_deref(), Some("upstream 503"));
    }

    #[tokio::test]
    async fn health_all_active_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        add_credential(&store, "a", "clouddoc", 1, 500).await;
        add_credential(&store, "b", "visionocr", 1, 500).await;
        let pool = CredentialPool::new(store, low_threshold_config());

        let health = pool.health().await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["credentials_total"], 2);
        assert_eq!(health["credentials_active"], 2);
    }

    #[tokio::test]
    async fn health_some_active_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        add_credential(&store, "a", "clouddoc", 1, 500).await;
        let b = add_credential(&store, "b", "clouddoc", 1, 500).await;
        store
            .set_status(&b, CredentialStatus::QuotaExceeded)
            .await
            .unwrap();
        let pool = CredentialPool::new(store, low_threshold_config());

        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["credentials_quota_exceeded"], 1);
    }

    #[tokio::test]
    async fn health_none_active_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = add_credential(&store, "a", "clouddoc", 1, 500).await;
        store
            .set_status(&a, CredentialStatus::Revoked)
            .await
            .unwrap();
        let pool = CredentialPool::new(store, low_threshold_config());

        let health = pool.health().await;
        assert_eq!(health["status"], "unhealthy");
        assert_eq!(health["credentials_revoked"], 1);
    }

    #[tokio::test]
    async fn health_empty_pool_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let pool = CredentialPool::new(store, PoolConfig::default());

        let health = pool.health().await;
        assert_eq!(health["status"], "unhealthy");
        assert_eq!(health["credentials_total"], 0);
    }
}
