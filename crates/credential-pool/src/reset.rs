//! Periodic quota reset sweep
//!
//! Spawns a background task that reopens quota windows whose reset time
//! has passed and reactivates credentials retired for quota exhaustion.
//! The sweep runs independently of the request path — request handlers
//! never perform resets themselves.

use std::sync::Arc;
use std::time::Duration;

use credential_store::now_millis;
use tracing::warn;

use crate::pool::CredentialPool;

/// Spawn a background task that runs the quota reset sweep every
/// `interval`.
///
/// Errors are logged and retried on the next tick; a failing state
/// file write must not kill the sweep.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_reset_task(
    pool: Arc<CredentialPool>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick — state was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = pool.run_reset(now_millis()).await {
                warn!(error = %e, "quota reset sweep failed, will retry next tick");
            }
        }
    })
}
