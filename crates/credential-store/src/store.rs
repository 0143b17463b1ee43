//! Credential state persistence
//!
//! Manages a JSON state file holding all credential records, their
//! quota windows, the rotation event log, and a bounded usage audit
//! log. All writes use atomic temp-file + rename to prevent corruption
//! on crash. A tokio Mutex serializes mutations, and every mutation is
//! flushed together with the audit record it implies in a single save —
//! a crash can lose the whole mutation but never half of it.
//!
//! The state file is the single source of truth. Selection reads clone
//! the in-memory state, so the request path never blocks on disk writes
//! longer than one save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cipher::SecretCipher;
use crate::error::{Error, Result};
use crate::types::{
    CredentialRecord, CredentialStatus, NewCredential, PeriodKind, QuotaWindow, RotationEvent,
    UsageOutcome, UsageRecord, now_millis,
};

/// Most recent usage records retained in the state file. Older lines
/// age out so the file stays bounded; billing export reads them first.
const MAX_USAGE_RECORDS: usize = 10_000;

/// Rotation events retained; rotations are rare so this is generous.
const MAX_ROTATION_EVENTS: usize = 1_000;

/// Everything persisted to the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    credentials: HashMap<String, CredentialRecord>,
    #[serde(default)]
    rotations: Vec<RotationEvent>,
    #[serde(default)]
    usage: Vec<UsageRecord>,
}

/// Thread-safe credential state manager.
pub struct CredentialStore {
    path: PathBuf,
    cipher: SecretCipher,
    state: Mutex<State>,
}

impl CredentialStore {
    /// Load state from the given file path.
    ///
    /// If the file doesn't exist, creates it as an empty state (cold
    /// start with zero credentials). Selection will report
    /// `NoCredentialAvailable` until credentials are added via the
    /// admin API.
    pub async fn load(path: PathBuf, cipher: SecretCipher) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading state file: {e}")))?;
            let state: State = serde_json::from_str(&contents)
                .map_err(|e| Error::StateParse(format!("parsing state file: {e}")))?;
            info!(path = %path.display(), credentials = state.credentials.len(), "loaded credential state");
            state
        } else {
            info!(path = %path.display(), "state file not found, starting with empty store");
            let state = State::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            cipher,
            state: Mutex::new(state),
        })
    }

    /// Create a credential: encrypt the secret, open fresh MONTHLY and
    /// DAILY quota windows, persist, and return the stored record.
    pub async fn add(&self, new: NewCredential) -> Result<CredentialRecord> {
        let now = now_millis();
        let daily_limit = new.daily_limit.unwrap_or(new.monthly_limit / 30);
        let record = CredentialRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            provider: new.provider,
            secret: self.cipher.encrypt(new.secret.expose())?,
            status: CredentialStatus::Active,
            priority: new.priority,
            last_used_at: None,
            notes: new.notes,
            monthly: QuotaWindow::new(PeriodKind::Monthly, new.monthly_limit, now),
            daily: QuotaWindow::new(PeriodKind::Daily, daily_limit, now),
        };

        let mut state = self.state.lock().await;
        state.credentials.insert(record.id.clone(), record.clone());
        debug!(credential_id = record.id, provider = record.provider, "added credential");
        write_atomic(&self.path, &state).await?;
        Ok(record)
    }

    /// Get a clone of a specific credential record.
    pub async fn get(&self, id: &str) -> Option<CredentialRecord> {
        let state = self.state.lock().await;
        state.credentials.get(id).cloned()
    }

    /// Snapshot of all credential records.
    pub async fn list(&self) -> Vec<CredentialRecord> {
        let state = self.state.lock().await;
        state.credentials.values().cloned().collect()
    }

    /// Snapshot of all records for one provider.
    pub async fn by_provider(&self, provider: &str) -> Vec<CredentialRecord> {
        let state = self.state.lock().await;
        state
            .credentials
            .values()
            .filter(|c| c.provider == provider)
            .cloned()
            .collect()
    }

    /// Remove a credential (explicit admin action only).
    ///
    /// Returns the removed record if it existed. Usage history lines
    /// referencing the id are kept — they are the billing record.
    pub async fn remove(&self, id: &str) -> Result<Option<CredentialRecord>> {
        let mut state = self.state.lock().await;
        let removed = state.credentials.remove(id);
        if removed.is_some() {
            debug!(credential_id = id, "removed credential");
            write_atomic(&self.path, &state).await?;
        }
        Ok(removed)
    }

    /// Decrypt a credential's secret, in memory only.
    pub async fn decrypt_secret(&self, id: &str) -> Result<common::Secret<String>> {
        let state = self.state.lock().await;
        let record = state
            .credentials
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("credential {id} not in store")))?;
        self.cipher.decrypt(&record.secret)
    }

    /// Set a credential's status and persist.
    pub async fn set_status(&self, id: &str, status: CredentialStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .credentials
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("credential {id} not in store")))?;
        record.status = status;
        write_atomic(&self.path, &state).await
    }

    /// Apply a rotation: flip the outgoing credential's status and log
    /// the hand-off event in the same save.
    pub async fn apply_rotation(
        &self,
        id: &str,
        status: CredentialStatus,
        event: RotationEvent,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .credentials
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("credential {id} not in store")))?;
        record.status = status;
        state.rotations.push(event);
        if state.rotations.len() > MAX_ROTATION_EVENTS {
            let excess = state.rotations.len() - MAX_ROTATION_EVENTS;
            state.rotations.drain(..excess);
        }
        write_atomic(&self.path, &state).await
    }

    /// Record one call attempt against a credential.
    ///
    /// On `Success` the token delta is consumed from BOTH quota windows
    /// and `last_used_at` is set; on `Error` only the audit line is
    /// written. The audit line and the counter updates land in one
    /// save. Returns the monthly window after the update so the caller
    /// can check the preemptive-rotation threshold.
    pub async fn apply_usage(
        &self,
        id: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
        outcome: UsageOutcome,
        detail: Option<String>,
    ) -> Result<QuotaWindow> {
        let now = now_millis();
        let mut state = self.state.lock().await;
        let record = state
            .credentials
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("credential {id} not in store")))?;

        if outcome == UsageOutcome::Success {
            let delta = tokens_in + tokens_out;
            record.monthly.consume(delta);
            record.daily.consume(delta);
            record.last_used_at = Some(now);
        }
        let monthly = record.monthly.clone();

        state.usage.push(UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            credential_id: id.to_string(),
            at: now,
            tokens_in,
            tokens_out,
            cost,
            outcome,
            detail,
        });
        if state.usage.len() > MAX_USAGE_RECORDS {
            let excess = state.usage.len() - MAX_USAGE_RECORDS;
            state.usage.drain(..excess);
        }

        write_atomic(&self.path, &state).await?;
        Ok(monthly)
    }

    /// Reset every quota window whose `reset_at` has passed.
    ///
    /// A `QuotaExceeded` credential whose MONTHLY window reset
    /// transitions back to `Active`. `Revoked` credentials are never
    /// reactivated here — revocation is terminal.
    pub async fn reset_due(&self, now: u64) -> Result<ResetSummary> {
        let mut state = self.state.lock().await;
        let mut summary = ResetSummary::default();

        for record in state.credentials.values_mut() {
            let monthly_due = record.monthly.is_due(now);
            if monthly_due {
                record.monthly.reset(PeriodKind::Monthly, now);
                summary.windows_reset += 1;
            }
            if record.daily.is_due(now) {
                record.daily.reset(PeriodKind::Daily, now);
                summary.windows_reset += 1;
            }
            if monthly_due && record.status == CredentialStatus::QuotaExceeded {
                record.status = CredentialStatus::Active;
                summary.reactivated.push(record.id.clone());
            }
        }

        if summary.windows_reset > 0 {
            write_atomic(&self.path, &state).await?;
        }
        Ok(summary)
    }

    /// Most recent usage records, newest last.
    pub async fn usage_records(&self, limit: usize) -> Vec<UsageRecord> {
        let state = self.state.lock().await;
        let start = state.usage.len().saturating_sub(limit);
        state.usage[start..].to_vec()
    }

    /// Most recent rotation events, newest last.
    pub async fn rotation_events(&self, limit: usize) -> Vec<RotationEvent> {
        let state = self.state.lock().await;
        let start = state.rotations.len().saturating_sub(limit);
        state.rotations[start..].to_vec()
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.credentials.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Result of a `reset_due` sweep.
#[derive(Debug, Default)]
pub struct ResetSummary {
    pub windows_reset: usize,
    /// Credentials flipped QuotaExceeded → Active
    pub reactivated: Vec<String>,
}

/// Write state to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it
/// over the target. Sets file permissions to 0600 since the file
/// contains encrypted secrets and billing data.
async fn write_atomic(path: &Path, state: &State) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::StateParse(format!("serializing state: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("state path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".pool-state.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting state file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp state file: {e}")))?;

    debug!(path = %path.display(), "persisted credential state");
    Ok(())
}
