//! Per-user premium operation guard
//!
//! Limits how many premium operations (those that touch a paid
//! provider) an owner may perform per billing period, independent of
//! which credential serves them. Reservation is optimistic: `used` is
//! incremented before the provider call so a burst of concurrent
//! requests cannot overshoot the limit while calls are in flight, and
//! released only when the whole chain ultimately fails.
//!
//! Owners with a live subscription are metered against its plan limit;
//! owners without one fall back to a per-owner legacy counter kept for
//! pre-subscription accounts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Fixed billing window length (30 days).
const PERIOD_MILLIS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Current unix time in milliseconds.
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Subscription lifecycle status.
///
/// Only `Active` and `Trial` grant premium capacity; every other status
/// sends the owner to the legacy counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trial,
    Expired,
    Cancelled,
    Suspended,
}

/// Per-owner premium allowance tied to a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub owner: String,
    pub plan: String,
    pub monthly_limit: u64,
    pub used: u64,
    pub period_start: u64,
    /// `None` means the subscription never expires (and never resets)
    pub period_end: Option<u64>,
    pub status: SubscriptionStatus,
}

impl Subscription {
    /// Active and Trial subscriptions grant capacity; an elapsed period
    /// rolls over on access rather than expiring the subscription.
    fn is_live(&self) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        )
    }

    /// Zero the counter and advance the period past `now` by whole windows.
    fn roll_period(&mut self, now: u64) {
        if let Some(end) = self.period_end
            && end <= now
        {
            let mut new_end = end;
            while new_end <= now {
                new_end += PERIOD_MILLIS;
            }
            self.period_start = new_end - PERIOD_MILLIS;
            self.period_end = Some(new_end);
            self.used = 0;
        }
    }
}

/// Pre-subscription per-owner counter, same reserve/release semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyCounter {
    used: u64,
    limit: u64,
    period_start: u64,
    period_end: u64,
}

impl LegacyCounter {
    fn new(limit: u64, now: u64) -> Self {
        Self {
            used: 0,
            limit,
            period_start: now,
            period_end: now + PERIOD_MILLIS,
        }
    }

    fn roll_period(&mut self, now: u64) {
        if self.period_end <= now {
            while self.period_end <= now {
                self.period_end += PERIOD_MILLIS;
            }
            self.period_start = self.period_end - PERIOD_MILLIS;
            self.used = 0;
        }
    }
}

/// Everything persisted to the guard's state file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    subscriptions: HashMap<String, Subscription>,
    #[serde(default)]
    legacy: HashMap<String, LegacyCounter>,
}

/// Snapshot returned to the caller after a successful reservation.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    /// Unix millis of the next reset; `None` for non-expiring subscriptions
    pub resets_at: Option<u64>,
}

/// Premium-operation gate, provider-agnostic.
pub struct QuotaGuard {
    path: PathBuf,
    default_legacy_limit: u64,
    state: Mutex<State>,
}

impl QuotaGuard {
    /// Load guard state from the given file path.
    ///
    /// Cold start creates an empty state file; owners get a legacy
    /// counter with `default_legacy_limit` on first reservation.
    pub async fn load(path: PathBuf, default_legacy_limit: u64) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading quota state file: {e}")))?;
            let state: State = serde_json::from_str(&contents)
                .map_err(|e| Error::StateParse(format!("parsing quota state file: {e}")))?;
            info!(path = %path.display(), subscriptions = state.subscriptions.len(), "loaded user quota state");
            state
        } else {
            info!(path = %path.display(), "quota state file not found, starting empty");
            let state = State::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            default_legacy_limit,
            state: Mutex::new(state),
        })
    }

    /// Reserve one premium operation for `owner`.
    ///
    /// Resolves the owner's live subscription (Active or Trial with a
    /// period end in the future or none set), falling back to the
    /// legacy counter. Rolls elapsed periods over lazily, then either
    /// rejects with `QuotaExceeded` — a hard stop, never silently
    /// degraded — or increments `used` optimistically and returns a
    /// snapshot. The increment is provisional until the call outcome
    /// is known; `release` undoes it on chain failure.
    pub async fn reserve(&self, owner: &str) -> Result<QuotaSnapshot> {
        let now = now_millis();
        let mut state = self.state.lock().await;

        let (limit, used, resets_at, plan) = match state.subscriptions.get_mut(owner) {
            Some(sub) if sub.is_live() => {
                sub.roll_period(now);
                if sub.used >= sub.monthly_limit {
                    let err = quota_exceeded(
                        sub.monthly_limit,
                        sub.used,
                        sub.period_end,
                        Some(sub.plan.clone()),
                        now,
                    );
                    debug!(owner, plan = sub.plan, "premium quota exhausted");
                    return Err(err);
                }
                sub.used += 1;
                (sub.monthly_limit, sub.used, sub.period_end, sub.plan.clone())
            }
            _ => {
                let default_limit = self.default_legacy_limit;
                let counter = state
                    .legacy
                    .entry(owner.to_string())
                    .or_insert_with(|| LegacyCounter::new(default_limit, now));
                counter.roll_period(now);
                if counter.used >= counter.limit {
                    let err = quota_exceeded(
                        counter.limit,
                        counter.used,
                        Some(counter.period_end),
                        None,
                        now,
                    );
                    debug!(owner, "legacy premium quota exhausted");
                    return Err(err);
                }
                counter.used += 1;
                let snapshot = (
                    counter.limit,
                    counter.used,
                    Some(counter.period_end),
                    String::new(),
                );
                snapshot
            }
        };

        write_atomic(&self.path, &state).await?;
        debug!(owner, used, limit, plan = %plan, "premium operation reserved");
        Ok(QuotaSnapshot {
            limit,
            used,
            remaining: limit.saturating_sub(used),
            resets_at,
        })
    }

    /// Undo one reservation after the whole chain failed (or the
    /// operation was aborted for reasons unrelated to provider
    /// failure). Never decrements below zero.
    pub async fn release(&self, owner: &str) -> Result<()> {
        let now = now_millis();
        let mut state = self.state.lock().await;

        match state.subscriptions.get_mut(owner) {
            Some(sub) if sub.is_live() => {
                sub.used = sub.used.saturating_sub(1);
            }
            _ => {
                if let Some(counter) = state.legacy.get_mut(owner) {
                    counter.used = counter.used.saturating_sub(1);
                }
            }
        }

        write_atomic(&self.path, &state).await?;
        debug!(owner, "premium reservation released");
        Ok(())
    }

    /// Replace the owner's subscription wholesale on plan change:
    /// `used` resets to zero, the limit and period start fresh.
    pub async fn upgrade_plan(
        &self,
        owner: &str,
        plan: &str,
        monthly_limit: u64,
    ) -> Result<Subscription> {
        let now = now_millis();
        let subscription = Subscription {
            owner: owner.to_string(),
            plan: plan.to_string(),
            monthly_limit,
            used: 0,
            period_start: now,
            period_end: Some(now + PERIOD_MILLIS),
            status: SubscriptionStatus::Active,
        };

        let mut state = self.state.lock().await;
        state
            .subscriptions
            .insert(owner.to_string(), subscription.clone());
        write_atomic(&self.path, &state).await?;
        info!(owner, plan, monthly_limit, "subscription plan replaced");
        Ok(subscription)
    }

    /// Insert or replace a subscription record as-is (admin surface).
    pub async fn insert_subscription(&self, subscription: Subscription) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .insert(subscription.owner.clone(), subscription);
        write_atomic(&self.path, &state).await
    }

    /// Current standing for an owner without reserving anything.
    pub async fn snapshot(&self, owner: &str) -> Option<QuotaSnapshot> {
        let now = now_millis();
        let state = self.state.lock().await;
        match state.subscriptions.get(owner) {
            Some(sub) if sub.is_live() => Some(QuotaSnapshot {
                limit: sub.monthly_limit,
                used: sub.used,
                remaining: sub.monthly_limit.saturating_sub(sub.used),
                resets_at: sub.period_end,
            }),
            _ => state.legacy.get(owner).map(|counter| QuotaSnapshot {
                limit: counter.limit,
                used: counter.used,
                remaining: counter.limit.saturating_sub(counter.used),
                resets_at: Some(counter.period_end),
            }),
        }
    }
}

/// Build the QuotaExceeded error with the UX-facing fields filled in.
fn quota_exceeded(
    limit: u64,
    used: u64,
    period_end: Option<u64>,
    plan: Option<String>,
    now: u64,
) -> Error {
    let resets_in_days = period_end.map(|end| (end.saturating_sub(now)).div_ceil(86_400_000));
    let suggestion = match resets_in_days {
        Some(days) => format!("upgrade your plan or wait {days} day(s) for the quota to reset"),
        None => "upgrade your plan to continue using premium conversions".to_string(),
    };
    Error::QuotaExceeded {
        limit,
        used,
        resets_in_days,
        plan,
        suggestion,
    }
}

/// Write state to a file atomically (temp file + rename).
async fn write_atomic(path: &Path, state: &State) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::StateParse(format!("serializing quota state: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("quota state path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".user-quota.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp quota state file: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp quota state file: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_guard(dir: &tempfile::TempDir, default_limit: u64) -> QuotaGuard {
        let path = dir.path().join("user-quota.json");
        QuotaGuard::load(path, default_limit).await.unwrap()
    }

    fn active_subscription(owner: &str, limit: u64, used: u64) -> Subscription {
        let now = now_millis();
        Subscription {
            owner: owner.into(),
            plan: "pro".into(),
            monthly_limit: limit,
            used,
            period_start: now,
            period_end: Some(now + PERIOD_MILLIS),
            status: SubscriptionStatus::Active,
        }
    }

    #[tokio::test]
    async fn reserve_increments_optimistically() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 10).await;
        guard
            .insert_subscription(active_subscription("alice", 5, 0))
            .await
            .unwrap();

        let snapshot = guard.reserve("alice").await.unwrap();
        assert_eq!(snapshot.used, 1);
        assert_eq!(snapshot.limit, 5);
        assert_eq!(snapshot.remaining, 4);
        assert!(snapshot.resets_at.is_some());
    }

    #[tokio::test]
    async fn reserve_release_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 10).await;
        guard
            .insert_subscription(active_subscription("alice", 5, 2))
            .await
            .unwrap();

        guard.reserve("alice").await.unwrap();
        guard.release("alice").await.unwrap();

        let snapshot = guard.snapshot("alice").await.unwrap();
        assert_eq!(snapshot.used, 2, "release must undo the reservation");
    }

    #[tokio::test]
    async fn release_never_underflows() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 10).await;
        guard
            .insert_subscription(active_subscription("alice", 5, 0))
            .await
            .unwrap();

        guard.release("alice").await.unwrap();
        guard.release("alice").await.unwrap();

        let snapshot = guard.snapshot("alice").await.unwrap();
        assert_eq!(snapshot.used, 0);
    }

    #[tokio::test]
    async fn reserve_at_limit_is_hard_stop() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 10).await;
        guard
            .insert_subscription(active_subscription("alice", 5, 5))
            .await
            .unwrap();

        let err = guard.reserve("alice").await.unwrap_err();
        match err {
            Error::QuotaExceeded {
                limit,
                used,
                resets_in_days,
                plan,
                suggestion,
            } => {
                assert_eq!(limit, 5);
                assert_eq!(used, 5);
                assert!(resets_in_days.is_some());
                assert_eq!(plan.as_deref(), Some("pro"));
                assert!(!suggestion.is_empty());
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }

        // The failed reservation must not have incremented the counter
        let snapshot = guard.snapshot("alice").await.unwrap();
        assert_eq!(snapshot.used, 5);
    }

    #[tokio::test]
    async fn unknown_owner_gets_legacy_counter() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 3).await;

        let snapshot = guard.reserve("bob").await.unwrap();
        assert_eq!(snapshot.limit, 3, "legacy counter uses the default limit");
        assert_eq!(snapshot.used, 1);
    }

    #[tokio::test]
    async fn legacy_counter_enforces_its_limit() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 2).await;

        guard.reserve("bob").await.unwrap();
        guard.reserve("bob").await.unwrap();
        let err = guard.reserve("bob").await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { plan: None, .. }));
    }

    #[tokio::test]
    async fn expired_subscription_falls_back_to_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 7).await;
        let mut sub = active_subscription("carol", 100, 0);
        sub.status = SubscriptionStatus::Expired;
        guard.insert_subscription(sub).await.unwrap();

        let snapshot = guard.reserve("carol").await.unwrap();
        assert_eq!(
            snapshot.limit, 7,
            "expired subscription must not grant its plan limit"
        );
    }

    #[tokio::test]
    async fn suspended_subscription_falls_back_to_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 7).await;
        let mut sub = active_subscription("dave", 100, 0);
        sub.status = SubscriptionStatus::Suspended;
        guard.insert_subscription(sub).await.unwrap();

        let snapshot = guard.reserve("dave").await.unwrap();
        assert_eq!(snapshot.limit, 7);
    }

    #[tokio::test]
    async fn trial_subscription_grants_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 1).await;
        let mut sub = active_subscription("erin", 20, 0);
        sub.status = SubscriptionStatus::Trial;
        guard.insert_subscription(sub).await.unwrap();

        let snapshot = guard.reserve("erin").await.unwrap();
        assert_eq!(snapshot.limit, 20);
    }

    #[tokio::test]
    async fn no_expiry_subscription_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 1).await;
        let mut sub = active_subscription("frank", 50, 0);
        sub.period_end = None;
        guard.insert_subscription(sub).await.unwrap();

        let snapshot = guard.reserve("frank").await.unwrap();
        assert_eq!(snapshot.limit, 50);
        assert!(snapshot.resets_at.is_none());
    }

    #[tokio::test]
    async fn elapsed_period_rolls_over_and_resets_used() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 1).await;
        let now = now_millis();
        guard
            .insert_subscription(Subscription {
                owner: "grace".into(),
                plan: "pro".into(),
                monthly_limit: 5,
                used: 5,
                period_start: now - 2 * PERIOD_MILLIS,
                period_end: Some(now - PERIOD_MILLIS + 1000),
                status: SubscriptionStatus::Active,
            })
            .await
            .unwrap();

        // Period is long past: the counter must reset instead of rejecting
        let snapshot = guard.reserve("grace").await.unwrap();
        assert_eq!(snapshot.used, 1);
        assert!(
            snapshot.resets_at.unwrap() > now,
            "period must advance past now"
        );
    }

    #[tokio::test]
    async fn upgrade_plan_replaces_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let guard = test_guard(&dir, 1).await;
        guard
            .insert_subscription(active_subscription("alice", 5, 4))
            .await
            .unwrap();

        let upgraded = guard.upgrade_plan("alice", "business", 100).await.unwrap();
        assert_eq!(upgraded.monthly_limit, 100);
        assert_eq!(upgraded.used, 0, "upgrade resets the counter");
        assert_eq!(upgraded.plan, "business");

        let snapshot = guard.snapshot("alice").await.unwrap();
        assert_eq!(snapshot.remaining, 100);
    }

    #[tokio::test]
    async fn concurrent_reserves_respect_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let guard = std::sync::Arc::new(test_guard(&dir, 10).await);
        guard
            .insert_subscription(active_subscription("alice", 5, 0))
            .await
            .unwrap();

        let mut handles = vec![];
        for _ in 0..10 {
            let guard = guard.clone();
            handles.push(tokio::spawn(
                async move { guard.reserve("alice").await.is_ok() },
            ));
        }

        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5, "exactly the limit may be reserved concurrently");
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user-quota.json");
        let guard = QuotaGuard::load(path.clone(), 10).await.unwrap();
        guard
            .insert_subscription(active_subscription("alice", 5, 0))
            .await
            .unwrap();
        guard.reserve("alice").await.unwrap();
        drop(guard);

        let reloaded = QuotaGuard::load(path, 10).await.unwrap();
        let snapshot = reloaded.snapshot("alice").await.unwrap();
        assert_eq!(snapshot.used, 1);
    }
}
