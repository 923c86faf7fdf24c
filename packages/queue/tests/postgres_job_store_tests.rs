//! Integration tests for [`queue::postgres::PgJobStore`] against a real
//! Postgres instance, exercising the state machine transitions and
//! unique-key coalescing described in spec.md §4.1/§8 (P6, B3, B4) end to
//! end rather than against an in-memory fake.
//!
//! Mirrors the teacher's `packages/server/tests/common/harness.rs` shared
//! testcontainers pattern (one container reused by every test in the
//! binary, via a `tokio::sync::OnceCell`), simplified: this crate ships no
//! migrations directory (migration tooling is an out-of-scope collaborator
//! per spec.md §1), so the harness creates the handful of tables/functions
//! `PgJobStore`'s hand-written SQL expects directly.

use std::time::Duration;

use queue::backoff::QuadraticBackoff;
use queue::error::Error;
use queue::postgres::PgJobStore;
use queue::row::{EnqueueOptions, UniqueBy};
use queue::state::JobState;
use queue::store::JobStore;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedPg {
    pool: PgPool,
    _container: ContainerAsync<Postgres>,
}

static SHARED: OnceCell<SharedPg> = OnceCell::const_new();

async fn shared_pool() -> PgPool {
    let infra = SHARED
        .get_or_init(|| async {
            let container = Postgres::default()
                .start()
                .await
                .expect("failed to start postgres container");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");
            let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
            let pool = PgPool::connect(&url).await.expect("connect to postgres");
            bootstrap_schema(&pool).await;
            SharedPg { pool, _container: container }
        })
        .await;
    infra.pool.clone()
}

/// Creates the `jobs`/`leader_lease` tables and the `state_bit` helper
/// function `PgJobStore`'s queries rely on. Each test truncates `jobs`
/// before running so tests stay independent despite the shared container.
async fn bootstrap_schema(pool: &PgPool) {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            queue TEXT NOT NULL,
            state TEXT NOT NULL,
            attempt SMALLINT NOT NULL DEFAULT 0,
            max_attempts SMALLINT NOT NULL,
            priority SMALLINT NOT NULL,
            args JSONB NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            scheduled_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            attempted_at TIMESTAMPTZ,
            finalized_at TIMESTAMPTZ,
            unique_key BYTEA,
            errors JSONB NOT NULL DEFAULT '[]'::jsonb
        )
        "#,
    )
    .execute(pool)
    .await
    .expect("create jobs table");

    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION state_bit(s TEXT) RETURNS INT AS $$
            SELECT CASE s
                WHEN 'scheduled' THEN 1
                WHEN 'available' THEN 2
                WHEN 'running' THEN 4
                WHEN 'completed' THEN 8
                WHEN 'retryable' THEN 16
                WHEN 'cancelled' THEN 32
                WHEN 'discarded' THEN 64
                ELSE 0
            END
        $$ LANGUAGE sql IMMUTABLE
        "#,
    )
    .execute(pool)
    .await
    .expect("create state_bit function");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leader_lease (
            id BOOLEAN PRIMARY KEY DEFAULT TRUE,
            holder_id TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .expect("create leader_lease table");
}

async fn fresh_store() -> PgJobStore {
    let pool = shared_pool().await;
    sqlx::query("TRUNCATE jobs").execute(&pool).await.unwrap();
    sqlx::query("TRUNCATE leader_lease").execute(&pool).await.unwrap();
    PgJobStore::new(pool)
}

fn opts(queue: &str) -> EnqueueOptions {
    EnqueueOptions {
        queue: queue.to_string(),
        max_attempts: 3,
        priority: 2,
        unique: None,
        scheduled_at: None,
    }
}

#[tokio::test]
async fn enqueue_then_claim_transitions_available_to_running() {
    let store = fresh_store().await;
    let id = store
        .enqueue("analysis:analyze", serde_json::json!({"owner": "octocat", "repo": "hello-world"}), opts("analysis_default"))
        .await
        .unwrap();

    let claimed = store.claim_ready("analysis_default", "worker-1", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].row.id, id);
    assert_eq!(claimed[0].row.state.0, JobState::Running);
    assert_eq!(claimed[0].row.attempt, 1);

    // A second claim sees nothing left to pick up: the row is no longer `available`.
    let empty = store.claim_ready("analysis_default", "worker-2", 10).await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn claim_respects_fifo_by_scheduled_at_then_id() {
    let store = fresh_store().await;
    let first = store
        .enqueue("analysis:analyze", serde_json::json!({"n": 1}), opts("analysis_default"))
        .await
        .unwrap();
    let second = store
        .enqueue("analysis:analyze", serde_json::json!({"n": 2}), opts("analysis_default"))
        .await
        .unwrap();

    let claimed = store.claim_ready("analysis_default", "worker-1", 10).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].row.id, first);
    assert_eq!(claimed[1].row.id, second);
}

#[tokio::test]
async fn mark_completed_is_terminal_and_finalizes() {
    let store = fresh_store().await;
    let id = store
        .enqueue("analysis:analyze", serde_json::json!({}), opts("analysis_default"))
        .await
        .unwrap();
    store.claim_ready("analysis_default", "w1", 1).await.unwrap();
    store.mark_completed(id).await.unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.state.0, JobState::Completed);
    assert!(row.finalized_at.is_some());
}

#[tokio::test]
async fn retryable_failure_schedules_backoff_until_attempts_exhausted() {
    let store = fresh_store().await;
    let mut o = opts("analysis_default");
    o.max_attempts = 2;
    let id = store.enqueue("analysis:analyze", serde_json::json!({}), o).await.unwrap();

    store.claim_ready("analysis_default", "w1", 1).await.unwrap();
    store.mark_retryable(id, "clone failed", &QuadraticBackoff).await.unwrap();
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.state.0, JobState::Retryable);
    assert_eq!(row.errors.len(), 1);
    assert_eq!(row.errors[0].message, "clone failed");
    assert!(row.scheduled_at > chrono::Utc::now());

    // Force the row available again to simulate the backoff elapsing, then
    // exhaust the remaining attempt.
    sqlx::query("UPDATE jobs SET state = 'available' WHERE id = $1")
        .bind(id)
        .execute(&shared_pool().await)
        .await
        .unwrap();
    store.claim_ready("analysis_default", "w1", 1).await.unwrap();
    store.mark_retryable(id, "clone failed again", &QuadraticBackoff).await.unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.state.0, JobState::Discarded);
    assert_eq!(row.errors.len(), 2);
    assert!(row.finalized_at.is_some());
}

#[tokio::test]
async fn mark_cancelled_is_terminal_regardless_of_remaining_attempts() {
    let store = fresh_store().await;
    let mut o = opts("analysis_default");
    o.max_attempts = 10;
    let id = store.enqueue("analysis:analyze", serde_json::json!({}), o).await.unwrap();
    store.claim_ready("analysis_default", "w1", 1).await.unwrap();
    store.mark_cancelled(id, "invalid input").await.unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.state.0, JobState::Cancelled);
    assert!(row.finalized_at.is_some());
}

/// B2: a snoozed job does not occupy a worker slot — it leaves `running` for
/// `scheduled`, not staying claimed, so another job in the same queue can be
/// claimed immediately.
#[tokio::test]
async fn snooze_returns_job_to_scheduled_and_frees_the_slot() {
    let store = fresh_store().await;
    let snoozed = store
        .enqueue("specview:generate", serde_json::json!({"n": 1}), opts("specview_default"))
        .await
        .unwrap();
    let other = store
        .enqueue("specview:generate", serde_json::json!({"n": 2}), opts("specview_default"))
        .await
        .unwrap();

    store.claim_ready("specview_default", "w1", 10).await.unwrap();
    store.snooze(snoozed, Duration::from_secs(3600)).await.unwrap();

    let row = store.get(snoozed).await.unwrap().unwrap();
    assert_eq!(row.state.0, JobState::Scheduled);
    assert!(row.scheduled_at > chrono::Utc::now());

    // The other job claimed in the same batch is still `running` and
    // unaffected; the snoozed one is no longer occupying a slot at all.
    let other_row = store.get(other).await.unwrap().unwrap();
    assert_eq!(other_row.state.0, JobState::Running);
}

/// B4: shutdown-originated cancellation returns the job to `available`, not `failed`/`cancelled`.
#[tokio::test]
async fn release_for_shutdown_returns_running_job_to_available() {
    let store = fresh_store().await;
    let id = store.enqueue("analysis:analyze", serde_json::json!({}), opts("analysis_default")).await.unwrap();
    store.claim_ready("analysis_default", "w1", 1).await.unwrap();
    store.release_for_shutdown(id).await.unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.state.0, JobState::Available);
    assert!(row.finalized_at.is_none());
}

/// B3 / P6: a duplicate `unique` enqueue while the first job is non-final coalesces into one row.
#[tokio::test]
async fn duplicate_unique_enqueue_coalesces_while_non_final() {
    let store = fresh_store().await;
    let mut o = opts("analysis_default");
    o.unique = Some(UniqueBy::fields(vec!["owner", "repo", "user_id"]));
    let args = serde_json::json!({"owner": "octocat", "repo": "hello-world", "user_id": null});

    let first = store.enqueue("analysis:analyze", args.clone(), o.clone()).await.unwrap();
    let second = store.enqueue("analysis:analyze", args.clone(), o.clone()).await.unwrap();
    assert_eq!(first, second);

    // Claim so the row moves to `running` (still non-final) — still coalesces.
    store.claim_ready("analysis_default", "w1", 1).await.unwrap();
    let third = store.enqueue("analysis:analyze", args.clone(), o.clone()).await.unwrap();
    assert_eq!(first, third);

    // Only one row exists for that key.
    let pool = shared_pool().await;
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM jobs WHERE kind = 'analysis:analyze'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);

    // Once the job reaches a final state, a fresh enqueue with the same key inserts a new row.
    store.mark_completed(first).await.unwrap();
    let after_completion = store.enqueue("analysis:analyze", args, o).await.unwrap();
    assert_ne!(after_completion, first);
}

#[tokio::test]
async fn invalid_queue_name_is_rejected_before_any_write() {
    let store = fresh_store().await;
    let err = store
        .enqueue("analysis:analyze", serde_json::json!({}), opts("analysis:priority"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQueueName(_)));
}

#[tokio::test]
async fn promote_scheduled_moves_due_rows_to_available() {
    let store = fresh_store().await;
    let mut o = opts("analysis_scheduled");
    o.scheduled_at = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
    let id = store.enqueue("analysis:analyze", serde_json::json!({}), o).await.unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.state.0, JobState::Scheduled);

    let promoted = store.promote_scheduled("analysis_scheduled").await.unwrap();
    assert_eq!(promoted, 1);
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.state.0, JobState::Available);
}

#[tokio::test]
async fn reap_expired_leases_returns_stuck_running_jobs_to_available() {
    let store = fresh_store().await;
    let id = store.enqueue("analysis:analyze", serde_json::json!({}), opts("analysis_default")).await.unwrap();
    store.claim_ready("analysis_default", "w1", 1).await.unwrap();

    // Simulate a worker that crashed long ago: back-date `attempted_at`.
    let pool = shared_pool().await;
    sqlx::query("UPDATE jobs SET attempted_at = now() - interval '1 hour' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    let reaped = store.reap_expired_leases(Duration::from_secs(60)).await.unwrap();
    assert_eq!(reaped, 1);
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.state.0, JobState::Available);
}

#[tokio::test]
async fn purge_finalized_deletes_only_old_terminal_rows() {
    let store = fresh_store().await;
    let id = store.enqueue("analysis:analyze", serde_json::json!({}), opts("analysis_default")).await.unwrap();
    store.claim_ready("analysis_default", "w1", 1).await.unwrap();
    store.mark_completed(id).await.unwrap();

    let pool = shared_pool().await;
    sqlx::query("UPDATE jobs SET finalized_at = now() - interval '30 days' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    let purged = store.purge_finalized(chrono::Duration::days(7)).await.unwrap();
    assert_eq!(purged, 1);
    assert!(store.get(id).await.unwrap().is_none());
}

#[tokio::test]
async fn update_metadata_never_touches_args_or_unique_key() {
    let store = fresh_store().await;
    let mut o = opts("specview_default");
    o.unique = Some(UniqueBy::fields(vec!["analysis_id"]));
    let args = serde_json::json!({"analysis_id": "abc", "user_id": "u1"});
    let id = store.enqueue("specview:generate", args.clone(), o).await.unwrap();

    store
        .update_metadata(id, serde_json::json!({"batch_job_name": "batch-42", "batch_phase": "classification"}))
        .await
        .unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.args, args);
    assert_eq!(row.metadata["batch_job_name"], "batch-42");
}

#[tokio::test]
async fn leader_lease_is_exclusive_until_expiry() {
    let store = fresh_store().await;
    let got_a = store.acquire_or_renew_leader_lease("instance-a", Duration::from_secs(30)).await.unwrap();
    assert!(got_a);

    // A different holder cannot steal an unexpired lease.
    let got_b = store.acquire_or_renew_leader_lease("instance-b", Duration::from_secs(30)).await.unwrap();
    assert!(!got_b);

    // The current holder can renew.
    let renewed_a = store.acquire_or_renew_leader_lease("instance-a", Duration::from_secs(30)).await.unwrap();
    assert!(renewed_a);

    // Once expired, a different holder can take over.
    let pool = shared_pool().await;
    sqlx::query("UPDATE leader_lease SET expires_at = now() - interval '1 second'")
        .execute(&pool)
        .await
        .unwrap();
    let got_b_after_expiry = store.acquire_or_renew_leader_lease("instance-b", Duration::from_secs(30)).await.unwrap();
    assert!(got_b_after_expiry);
}

#[tokio::test]
async fn snapshot_counts_rows_by_state_for_one_queue() {
    let store = fresh_store().await;
    store.enqueue("analysis:analyze", serde_json::json!({"n": 1}), opts("analysis_default")).await.unwrap();
    store.enqueue("analysis:analyze", serde_json::json!({"n": 2}), opts("analysis_default")).await.unwrap();
    // Different queue: must not pollute the snapshot below.
    store.enqueue("analysis:analyze", serde_json::json!({"n": 3}), opts("analysis_priority")).await.unwrap();

    let claimed = store.claim_ready("analysis_default", "w1", 1).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let snap = store.snapshot("analysis_default").await.unwrap();
    assert_eq!(snap.available, 1);
    assert_eq!(snap.running, 1);
    assert_eq!(snap.scheduled, 0);
}
