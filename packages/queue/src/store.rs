//! The storage trait the runtime drives jobs through.
//!
//! Mirrors the teacher's `seesaw::job::JobStore` split (policy-light storage
//! interface, policy lives in the caller) but expands it to the full state
//! machine spec.md §4.1 requires: snooze, cancel, and leader-lease primitives
//! in addition to claim/complete/retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::error::Result;
use crate::row::{EnqueueOptions, JobRow};
use crate::state::JobState;

/// A job claimed by a worker, locked for the duration of the attempt.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub row: JobRow,
}

/// Snapshot of one queue's job counts by state (SPEC_FULL.md §11, queue introspection).
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub queue: String,
    pub scheduled: i64,
    pub available: i64,
    pub running: i64,
    pub retryable: i64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job row, or coalesce into an existing non-final row sharing
    /// the same unique key (spec.md I6). Returns the job id either way.
    async fn enqueue(&self, kind: &str, args: serde_json::Value, opts: EnqueueOptions) -> Result<Uuid>;

    /// Atomically claim up to `limit` available jobs from `queue`, ordered
    /// FIFO by `(scheduled_at, id)`, and mark them `running`.
    ///
    /// Implementations use `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent
    /// workers never double-claim a row.
    async fn claim_ready(&self, queue: &str, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>>;

    /// Terminal success.
    async fn mark_completed(&self, job_id: Uuid) -> Result<()>;

    /// Retryable failure. Transitions to `retryable` (and schedules the next
    /// attempt via `policy`) if `attempt < max_attempts`, else `discarded`.
    async fn mark_retryable(
        &self,
        job_id: Uuid,
        error_message: &str,
        policy: &dyn RetryPolicy,
    ) -> Result<()>;

    /// Permanent failure. Transitions to `cancelled` regardless of remaining attempts.
    async fn mark_cancelled(&self, job_id: Uuid, reason: &str) -> Result<()>;

    /// Re-park at `now + duration` without incrementing `attempt`.
    async fn snooze(&self, job_id: Uuid, duration: std::time::Duration) -> Result<()>;

    /// Return a job to `available` due to runtime-initiated cancellation
    /// (shutdown), as opposed to a handler-originated outcome. See spec.md B4.
    async fn release_for_shutdown(&self, job_id: Uuid) -> Result<()>;

    /// Promote `scheduled` rows whose `scheduled_at` has elapsed to `available`.
    /// Called by the leader's maintenance loop.
    async fn promote_scheduled(&self, queue: &str) -> Result<u64>;

    /// Reap `running` jobs whose lease (`attempted_at + lease_duration`) has
    /// expired — the worker that claimed them presumably crashed.
    async fn reap_expired_leases(&self, lease_duration: std::time::Duration) -> Result<u64>;

    /// Delete finalized rows older than `retention`.
    async fn purge_finalized(&self, retention: chrono::Duration) -> Result<u64>;

    /// Overwrites a job's runtime-internal `metadata` column (spec.md Design
    /// Notes, "Metadata vs. args"). Used by handlers that checkpoint a
    /// multi-invocation cursor — e.g. the SpecView batch-mode poll loop — so
    /// the cursor survives a snooze/resume cycle without touching `args`.
    async fn update_metadata(&self, job_id: Uuid, metadata: serde_json::Value) -> Result<()>;

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRow>>;

    async fn snapshot(&self, queue: &str) -> Result<QueueSnapshot>;

    /// Attempt to acquire or renew the single leader lease. Returns `true` if
    /// this caller holds the lease after the call.
    async fn acquire_or_renew_leader_lease(
        &self,
        holder_id: &str,
        lease_duration: std::time::Duration,
    ) -> Result<bool>;
}

/// Used by [`JobStore::mark_retryable`] implementations to decide the next state.
pub fn next_state_after_failure(attempt: i16, max_attempts: i16) -> JobState {
    if attempt >= max_attempts {
        JobState::Discarded
    } else {
        JobState::Retryable
    }
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_attempts_discard_instead_of_retry() {
        assert_eq!(next_state_after_failure(3, 3), JobState::Discarded);
        assert_eq!(next_state_after_failure(2, 3), JobState::Retryable);
    }
}
