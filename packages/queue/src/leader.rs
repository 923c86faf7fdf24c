//! Leader election and periodic maintenance (spec.md §4.1, "Leader election").
//!
//! A single lease row with an expiry timestamp; whichever instance holds it
//! runs maintenance: reaping stuck `running` jobs whose lease expired,
//! promoting due `scheduled` rows, and cleaning finalized rows past
//! retention. Renewal happens at a fraction of the lease interval so a
//! crashed leader's lease expires well before a healthy instance would give
//! up waiting for it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::store::JobStore;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub holder_id: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub job_lease_duration: Duration,
    pub finalized_retention: chrono::Duration,
    pub queues: Vec<String>,
}

impl MaintenanceConfig {
    pub fn new(holder_id: impl Into<String>, queues: Vec<String>) -> Self {
        let lease_duration = Duration::from_secs(30);
        Self {
            holder_id: holder_id.into(),
            lease_duration,
            renew_interval: lease_duration / 3,
            job_lease_duration: Duration::from_secs(600),
            finalized_retention: chrono::Duration::days(7),
            queues,
        }
    }
}

/// Runs the leader-election/maintenance loop until `shutdown` fires.
pub async fn run_maintenance_loop(
    store: Arc<dyn JobStore>,
    config: MaintenanceConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.renew_interval) => {}
            _ = shutdown.cancelled() => break,
        }

        let is_leader = match store
            .acquire_or_renew_leader_lease(&config.holder_id, config.lease_duration)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(error = %e, "leader lease acquisition failed");
                continue;
            }
        };

        if !is_leader {
            continue;
        }

        tracing::debug!(holder_id = %config.holder_id, "running leader maintenance pass");

        for queue in &config.queues {
            match store.promote_scheduled(queue).await {
                Ok(n) if n > 0 => tracing::debug!(queue, promoted = n, "promoted scheduled jobs"),
                Ok(_) => {}
                Err(e) => tracing::warn!(queue, error = %e, "promote_scheduled failed"),
            }

            // Backlog visibility (SPEC_FULL.md §11, "Queue introspection"):
            // logged from here rather than via `Handle` since the leader
            // already holds the store and this runs once per renewal tick.
            match store.snapshot(queue).await {
                Ok(s) if s.scheduled + s.available + s.retryable > 0 => tracing::debug!(
                    queue,
                    scheduled = s.scheduled,
                    available = s.available,
                    running = s.running,
                    retryable = s.retryable,
                    "queue backlog"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(queue, error = %e, "snapshot failed"),
            }
        }

        match store.reap_expired_leases(config.job_lease_duration).await {
            Ok(n) if n > 0 => tracing::warn!(reaped = n, "reaped jobs with expired attempt leases"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "reap_expired_leases failed"),
        }

        match store.purge_finalized(config.finalized_retention).await {
            Ok(n) if n > 0 => tracing::debug!(purged = n, "purged finalized job rows"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "purge_finalized failed"),
        }
    }
}
