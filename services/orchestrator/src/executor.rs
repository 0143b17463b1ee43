//! Cascading fallback executor
//!
//! Runs one conversion request through its operation's ordered
//! candidate list: reserve user quota for premium candidates, select a
//! pool credential for providers that need one, invoke the adapter
//! under its timeout, and classify failures to decide between trying
//! the next candidate and aborting the chain.
//!
//! Per-request state machine: PENDING → TRYING(candidate i) →
//! {SUCCEEDED | TRYING(i+1) | EXHAUSTED}. Candidates are strictly
//! sequential — no speculative fan-out, since every attempt can consume
//! billable quota. No lock is held across adapter or store I/O, so
//! concurrent requests interleave freely.

use std::collections::HashMap;
use std::sync::Arc;

use credential_pool::{CredentialPool, SelectedCredential};
use credential_store::RotationReason;
use provider::{
    AdapterError, CandidateDescriptor, Disposition, OperationInput, OperationOutput,
    ProviderAdapter,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use user_quota::QuotaGuard;

use crate::metrics;
use crate::routing::RoutingTable;

/// One registered candidate: static metadata plus its adapter.
pub struct Candidate {
    pub descriptor: CandidateDescriptor,
    pub adapter: Arc<dyn ProviderAdapter>,
}

/// Successful conversion, with the metadata callers and billing need.
#[derive(Debug, Serialize)]
pub struct Conversion {
    /// Name of the candidate that produced the result
    pub technology_used: String,
    /// Quality label from the winning candidate's descriptor
    pub quality: String,
    /// Kind label from the winning candidate's descriptor
    pub kind: String,
    pub output: OperationOutput,
}

/// Why one candidate failed, kept for operator diagnosis.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptFailure {
    pub candidate: String,
    pub reason: String,
}

/// Terminal outcomes of a fallback chain.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// The routing table names a candidate that is not registered —
    /// a misconfiguration, surfaced loudly rather than skipped
    #[error("operation {operation} routes to unregistered candidate {candidate}")]
    UnknownCandidate { operation: String, candidate: String },

    /// User-level premium quota exhausted; carries the upgrade prompt
    #[error(transparent)]
    QuotaExceeded(user_quota::Error),

    /// Caller-fixable input problem, surfaced verbatim, never retried
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("all candidates failed for {operation} after {} attempt(s)", attempts.len())]
    AllCandidatesFailed {
        operation: String,
        attempts: Vec<AttemptFailure>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

/// The orchestrator's request path: candidate registry + routing +
/// credential pool + user quota guard.
pub struct FallbackExecutor {
    routing: Arc<RoutingTable>,
    candidates: HashMap<String, Candidate>,
    pool: Arc<CredentialPool>,
    guard: Arc<QuotaGuard>,
}

impl FallbackExecutor {
    pub fn new(
        routing: Arc<RoutingTable>,
        candidates: HashMap<String, Candidate>,
        pool: Arc<CredentialPool>,
        guard: Arc<QuotaGuard>,
    ) -> Self {
        Self {
            routing,
            candidates,
            pool,
            guard,
        }
    }

    /// Names of all registered candidates (admin routing validation).
    pub fn candidate_names(&self) -> Vec<String> {
        self.candidates.keys().cloned().collect()
    }

    /// Run `operation` for `owner` through its candidate chain.
    ///
    /// The candidate list is snapshotted up front: routing updates
    /// apply to new requests only, never to an in-flight chain.
    pub async fn execute(
        &self,
        owner: &str,
        operation: &str,
        input: OperationInput,
    ) -> Result<Conversion, ExecuteError> {
        let names = self
            .routing
            .candidates_for(operation)
            .await
            .ok_or_else(|| ExecuteError::UnknownOperation(operation.to_string()))?;

        let mut attempts: Vec<AttemptFailure> = Vec::new();
        let mut quota_rejection: Option<user_quota::Error> = None;

        for name in &names {
            let candidate =
                self.candidates
                    .get(name)
                    .ok_or_else(|| ExecuteError::UnknownCandidate {
                        operation: operation.to_string(),
                        candidate: name.clone(),
                    })?;
            let desc = &candidate.descriptor;

            // Once the user's premium allowance is rejected, only
            // free/local candidates remain eligible: silently retrying
            // other paid paths would bill past the cap, and skipping to
            // a cheaper paid provider would downgrade quality without
            // the user's knowledge.
            if quota_rejection.is_some() && desc.premium {
                attempts.push(AttemptFailure {
                    candidate: name.clone(),
                    reason: "skipped: premium quota exhausted".to_string(),
                });
                continue;
            }

            // 1. Reserve user quota before the call (optimistic)
            let mut reserved = false;
            if desc.premium {
                match self.guard.reserve(owner).await {
                    Ok(snapshot) => {
                        debug!(owner, candidate = name, used = snapshot.used, "premium reserved");
                        reserved = true;
                    }
                    Err(err @ user_quota::Error::QuotaExceeded { .. }) => {
                        // Expected, UX-actionable; not a system error
                        info!(owner, candidate = name, "premium quota exhausted");
                        metrics::record_quota_rejection();
                        attempts.push(AttemptFailure {
                            candidate: name.clone(),
                            reason: "user premium quota exhausted".to_string(),
                        });
                        quota_rejection = Some(err);
                        continue;
                    }
                    Err(e) => return Err(ExecuteError::Internal(e.to_string())),
                }
            }

            // 2. Select a credential for providers that need one
            let mut credential: Option<SelectedCredential> = None;
            if let Some(provider_name) = &desc.provider {
                match self.pool.select(provider_name).await {
                    Ok(selected) => credential = Some(selected),
                    Err(credential_pool::Error::NoCredentialAvailable { provider, detail }) => {
                        // Fatal at the provider level, recoverable at
                        // the chain level
                        warn!(
                            candidate = name,
                            provider,
                            detail,
                            "provider unavailable, trying next candidate"
                        );
                        metrics::record_fallback_attempt(name, "provider_unavailable");
                        attempts.push(AttemptFailure {
                            candidate: name.clone(),
                            reason: format!("provider {provider} unavailable: {detail}"),
                        });
                        if reserved {
                            self.release_quietly(owner).await;
                        }
                        continue;
                    }
                    Err(e) => {
                        if reserved {
                            self.release_quietly(owner).await;
                        }
                        return Err(ExecuteError::Internal(e.to_string()));
                    }
                }
            }

            // 3. Invoke under the candidate's timeout
            info!(candidate = name, operation, "attempting candidate");
            let secret = credential.as_ref().map(|c| &c.secret);
            let result = match tokio::time::timeout(
                desc.timeout(),
                candidate.adapter.invoke(secret, &input),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Transient(format!(
                    "timed out after {}s",
                    desc.timeout_secs
                ))),
            };

            match result {
                Ok(success) => {
                    // 4. Commit usage before returning; a failed write
                    // under-counts rather than failing the conversion
                    if let Some(cred) = &credential {
                        let cost = derive_cost(desc, success.tokens_in, success.tokens_out);
                        if let Err(e) = self
                            .pool
                            .track_usage(&cred.id, success.tokens_in, success.tokens_out, cost)
                            .await
                        {
                            warn!(credential_id = cred.id, error = %e, "failed to record usage");
                        }
                    }
                    info!(
                        candidate = name,
                        operation, owner, "conversion served"
                    );
                    metrics::record_conversion(operation, name, "success");
                    return Ok(Conversion {
                        technology_used: name.clone(),
                        quality: desc.quality.clone(),
                        kind: desc.kind.clone(),
                        output: success.output,
                    });
                }
                Err(err) => {
                    // 5. Classify and either continue or abort
                    if let Some(cred) = &credential {
                        if let Err(e) =
                            self.pool.record_failure(&cred.id, err.to_string()).await
                        {
                            warn!(credential_id = cred.id, error = %e, "failed to record failure");
                        }
                        match &err {
                            AdapterError::Unauthorized => {
                                if let Err(e) = self
                                    .pool
                                    .rotate(&cred.id, RotationReason::Revoked, "executor")
                                    .await
                                {
                                    warn!(credential_id = cred.id, error = %e, "rotation failed");
                                }
                            }
                            AdapterError::QuotaExceeded => {
                                if let Err(e) = self
                                    .pool
                                    .rotate(&cred.id, RotationReason::QuotaExceeded, "executor")
                                    .await
                                {
                                    warn!(credential_id = cred.id, error = %e, "rotation failed");
                                }
                            }
                            _ => {}
                        }
                    }
                    if reserved {
                        self.release_quietly(owner).await;
                    }

                    match err.disposition() {
                        Disposition::Abort => {
                            warn!(
                                candidate = name,
                                operation,
                                error = %err,
                                "input rejected, aborting chain"
                            );
                            metrics::record_conversion(operation, name, "invalid_input");
                            return Err(ExecuteError::InvalidInput(err.to_string()));
                        }
                        Disposition::Continue => {
                            warn!(
                                candidate = name,
                                operation,
                                error = %err,
                                "candidate failed, trying next"
                            );
                            metrics::record_fallback_attempt(name, error_label(&err));
                            attempts.push(AttemptFailure {
                                candidate: name.clone(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            }
        }

        // Chain exhausted. A premium quota rejection dominates: the
        // caller needs the upgrade prompt, not a generic failure.
        if let Some(err) = quota_rejection {
            metrics::record_conversion(operation, "none", "quota_exceeded");
            return Err(ExecuteError::QuotaExceeded(err));
        }

        error!(
            operation,
            attempts = ?attempts,
            "all candidates failed"
        );
        metrics::record_conversion(operation, "none", "exhausted");
        Err(ExecuteError::AllCandidatesFailed {
            operation: operation.to_string(),
            attempts,
        })
    }

    /// Release a reservation, logging rather than propagating failures —
    /// release runs on error paths where the original error matters more.
    async fn release_quietly(&self, owner: &str) {
        if let Err(e) = self.guard.release(owner).await {
            warn!(owner, error = %e, "failed to release premium reservation");
        }
    }
}

/// Derive the billing cost from the candidate's per-1k unit rate.
fn derive_cost(desc: &CandidateDescriptor, tokens_in: u64, tokens_out: u64) -> f64 {
    (tokens_in + tokens_out) as f64 / 1000.0 * desc.cost_per_1k
}

/// Short metric label for a Continue-class adapter error.
fn error_label(err: &AdapterError) -> &'static str {
    match err {
        AdapterError::Unauthorized => "unauthorized",
        AdapterError::QuotaExceeded => "provider_quota",
        AdapterError::UnsupportedCapability(_) => "unsupported",
        AdapterError::Transient(_) => "transient",
        AdapterError::InvalidInput(_) => "invalid_input",
        AdapterError::Unknown(_) => "unknown",
    }
}
