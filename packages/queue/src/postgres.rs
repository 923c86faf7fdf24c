//! Postgres-backed [`JobStore`].
//!
//! SQL is hand-written with `sqlx::query`/`query_as` (not the `query!` macro),
//! matching the teacher's `intelligent-crawler::storage::postgres` style: no
//! compile-time `DATABASE_URL` requirement, row mapping via `sqlx::Row::get`.
//!
//! Migrations that create the `jobs` / `leader_lease` tables are the
//! deployment wrapper's responsibility (spec.md §1, "database migration
//! tooling" is an out-of-scope collaborator); this module only issues DML.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::error::{Error, Result};
use crate::row::{validate_queue_name, EnqueueOptions, JobError, JobRow, JobStateWire};
use crate::state::JobState;
use crate::store::{next_state_after_failure, ClaimedJob, JobStore, QueueSnapshot};
use crate::unique_key;

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_from_sql(row: &sqlx::postgres::PgRow) -> sqlx::Result<JobRow> {
        let state_str: String = row.try_get("state")?;
        let state = JobStateWire::try_from(state_str)
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let errors_json: serde_json::Value = row.try_get("errors")?;
        let errors: Vec<JobError> = serde_json::from_value(errors_json).unwrap_or_default();
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            queue: row.try_get("queue")?,
            state,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            priority: row.try_get("priority")?,
            args: row.try_get("args")?,
            metadata: row.try_get("metadata")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            attempted_at: row.try_get("attempted_at")?,
            finalized_at: row.try_get("finalized_at")?,
            unique_key: row.try_get("unique_key")?,
            errors,
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, kind: &str, args: serde_json::Value, opts: EnqueueOptions) -> Result<Uuid> {
        if !validate_queue_name(&opts.queue) {
            return Err(Error::InvalidQueueName(opts.queue));
        }

        let unique_key = opts
            .unique
            .as_ref()
            .map(|u| unique_key::compute(kind, &args, u));

        if let Some(key) = &unique_key {
            let states_mask = opts.unique.as_ref().unwrap().states_bitmask as i32;
            let existing = sqlx::query(
                r#"
                SELECT id FROM jobs
                WHERE unique_key = $1
                  AND (state_bit(state) & $2) != 0
                LIMIT 1
                "#,
            )
            .bind(key)
            .bind(states_mask)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = existing {
                let id: Uuid = row.try_get("id")?;
                tracing::debug!(job_id = %id, kind, "enqueue coalesced with existing job");
                return Ok(id);
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let scheduled_at = opts.scheduled_at.unwrap_or(now);
        let initial_state = if scheduled_at <= now {
            JobState::Available
        } else {
            JobState::Scheduled
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, queue, state, attempt, max_attempts, priority,
                args, metadata, scheduled_at, created_at, unique_key, errors
            ) VALUES ($1, $2, $3, $4, 0, $5, $6, $7, '{}'::jsonb, $8, $9, $10, '[]'::jsonb)
            "#,
        )
        .bind(id)
        .bind(kind)
        .bind(&opts.queue)
        .bind(initial_state.as_db_str())
        .bind(opts.max_attempts)
        .bind(opts.priority)
        .bind(&args)
        .bind(scheduled_at)
        .bind(now)
        .bind(unique_key)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_ready(&self, queue: &str, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            WITH claimed AS (
                SELECT id FROM jobs
                WHERE queue = $1 AND state = 'available'
                ORDER BY scheduled_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'running', attempt = attempt + 1, attempted_at = $3
            WHERE id IN (SELECT id FROM claimed)
            RETURNING id, kind, queue, state, attempt, max_attempts, priority,
                      args, metadata, scheduled_at, created_at, attempted_at,
                      finalized_at, unique_key, errors
            "#,
        )
        .bind(queue)
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(ClaimedJob {
                row: Self::row_from_sql(row)?,
            });
        }
        tracing::debug!(queue, worker_id, claimed = out.len(), "claimed jobs");
        Ok(out)
    }

    async fn mark_completed(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE jobs SET state = 'completed', finalized_at = $2 WHERE id = $1"#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retryable(
        &self,
        job_id: Uuid,
        error_message: &str,
        policy: &dyn RetryPolicy,
    ) -> Result<()> {
        let row = sqlx::query(r#"SELECT attempt, max_attempts, errors FROM jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;

        let attempt: i16 = row.try_get("attempt")?;
        let max_attempts: i16 = row.try_get("max_attempts")?;
        let errors_json: serde_json::Value = row.try_get("errors")?;
        let mut errors: Vec<JobError> = serde_json::from_value(errors_json).unwrap_or_default();
        errors.push(JobError {
            attempt,
            at: Utc::now(),
            message: error_message.to_string(),
        });

        let next = next_state_after_failure(attempt, max_attempts);
        let (scheduled_at, finalized_at) = if next == JobState::Retryable {
            (Utc::now() + chrono::Duration::from_std(policy.delay_for_attempt(attempt)).unwrap(), None)
        } else {
            (Utc::now(), Some(Utc::now()))
        };

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2, scheduled_at = $3, finalized_at = $4, errors = $5
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(next.as_db_str())
        .bind(scheduled_at)
        .bind(finalized_at)
        .bind(serde_json::to_value(&errors).unwrap())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_cancelled(&self, job_id: Uuid, reason: &str) -> Result<()> {
        let row = sqlx::query(r#"SELECT attempt, errors FROM jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        let attempt: i16 = row.try_get("attempt")?;
        let errors_json: serde_json::Value = row.try_get("errors")?;
        let mut errors: Vec<JobError> = serde_json::from_value(errors_json).unwrap_or_default();
        errors.push(JobError {
            attempt,
            at: Utc::now(),
            message: reason.to_string(),
        });

        sqlx::query(
            r#"UPDATE jobs SET state = 'cancelled', finalized_at = $2, errors = $3 WHERE id = $1"#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .bind(serde_json::to_value(&errors).unwrap())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn snooze(&self, job_id: Uuid, duration: Duration) -> Result<()> {
        let scheduled_at = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        sqlx::query(r#"UPDATE jobs SET state = 'scheduled', scheduled_at = $2 WHERE id = $1"#)
            .bind(job_id)
            .bind(scheduled_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_for_shutdown(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(r#"UPDATE jobs SET state = 'available' WHERE id = $1 AND state = 'running'"#)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn promote_scheduled(&self, queue: &str) -> Result<u64> {
        let res = sqlx::query(
            r#"UPDATE jobs SET state = 'available' WHERE queue = $1 AND state = 'scheduled' AND scheduled_at <= $2"#,
        )
        .bind(queue)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn reap_expired_leases(&self, lease_duration: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(lease_duration).unwrap_or_default();
        let res = sqlx::query(
            r#"UPDATE jobs SET state = 'available' WHERE state = 'running' AND attempted_at < $1"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            tracing::warn!(reaped = res.rows_affected(), "reaped stuck running jobs");
        }
        Ok(res.rows_affected())
    }

    async fn purge_finalized(&self, retention: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;
        let res = sqlx::query(
            r#"DELETE FROM jobs WHERE finalized_at IS NOT NULL AND finalized_at < $1"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn update_metadata(&self, job_id: Uuid, metadata: serde_json::Value) -> Result<()> {
        sqlx::query(r#"UPDATE jobs SET metadata = $2 WHERE id = $1"#)
            .bind(job_id)
            .bind(metadata)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, queue, state, attempt, max_attempts, priority,
                   args, metadata, scheduled_at, created_at, attempted_at,
                   finalized_at, unique_key, errors
            FROM jobs WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::row_from_sql(&r)).transpose().map_err(Error::from)
    }

    async fn snapshot(&self, queue: &str) -> Result<QueueSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'scheduled') AS scheduled,
                COUNT(*) FILTER (WHERE state = 'available') AS available,
                COUNT(*) FILTER (WHERE state = 'running') AS running,
                COUNT(*) FILTER (WHERE state = 'retryable') AS retryable
            FROM jobs WHERE queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueSnapshot {
            queue: queue.to_string(),
            scheduled: row.try_get("scheduled")?,
            available: row.try_get("available")?,
            running: row.try_get("running")?,
            retryable: row.try_get("retryable")?,
        })
    }

    async fn acquire_or_renew_leader_lease(
        &self,
        holder_id: &str,
        lease_duration: Duration,
    ) -> Result<bool> {
        let expires_at = Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        let res = sqlx::query(
            r#"
            INSERT INTO leader_lease (id, holder_id, expires_at)
            VALUES (TRUE, $1, $2)
            ON CONFLICT (id) DO UPDATE
            SET holder_id = EXCLUDED.holder_id, expires_at = EXCLUDED.expires_at
            WHERE leader_lease.holder_id = $1 OR leader_lease.expires_at < now()
            "#,
        )
        .bind(holder_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}
