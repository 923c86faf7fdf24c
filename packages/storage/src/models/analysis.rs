//! Analysis: one execution of the parse pipeline over a specific commit (spec.md §3).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Analysis {
    pub id: Uuid,
    pub codebase_id: Uuid,
    pub commit_sha: String,
    pub branch: String,
    pub status: String,
    pub parser_version: String,
    pub total_suites: i32,
    pub total_tests: i32,
    pub committed_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub codebase_id: Uuid,
    pub commit_sha: String,
    pub branch: String,
    pub parser_version: String,
}

#[async_trait]
pub trait AnalysisRepository: Send + Sync {
    /// Invariant I3: at most one `completed` analysis per
    /// `(codebase_id, commit_sha, parser_version)`.
    async fn find_completed(
        &self,
        codebase_id: Uuid,
        commit_sha: &str,
        parser_version: &str,
    ) -> Result<Option<Analysis>>;

    async fn insert_pending(&self, new: NewAnalysis) -> Result<Analysis>;

    async fn mark_running(&self, id: Uuid) -> Result<()>;

    async fn mark_completed(
        &self,
        id: Uuid,
        total_suites: i32,
        total_tests: i32,
        committed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Analysis>>;

    /// Most recent completed analysis for a codebase, used by the SpecView
    /// pipeline's incremental-placement diffing (spec.md §4.8).
    async fn latest_completed_for_codebase(&self, codebase_id: Uuid) -> Result<Option<Analysis>>;
}

pub struct PgAnalysisRepository {
    pool: PgPool,
}

impl PgAnalysisRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalysisRepository for PgAnalysisRepository {
    async fn find_completed(
        &self,
        codebase_id: Uuid,
        commit_sha: &str,
        parser_version: &str,
    ) -> Result<Option<Analysis>> {
        let row = sqlx::query_as::<_, Analysis>(
            r#"
            SELECT * FROM analyses
            WHERE codebase_id = $1 AND commit_sha = $2 AND parser_version = $3 AND status = 'completed'
            "#,
        )
        .bind(codebase_id)
        .bind(commit_sha)
        .bind(parser_version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_pending(&self, new: NewAnalysis) -> Result<Analysis> {
        let row = sqlx::query_as::<_, Analysis>(
            r#"
            INSERT INTO analyses (
                id, codebase_id, commit_sha, branch, status, parser_version,
                total_suites, total_tests, started_at
            ) VALUES ($1, $2, $3, $4, 'pending', $5, 0, 0, now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.codebase_id)
        .bind(&new.commit_sha)
        .bind(&new.branch)
        .bind(&new.parser_version)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_running(&self, id: Uuid) -> Result<()> {
        sqlx::query(r#"UPDATE analyses SET status = 'running' WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        total_suites: i32,
        total_tests: i32,
        committed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE analyses
            SET status = 'completed', total_suites = $2, total_tests = $3,
                committed_at = $4, completed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total_suites)
        .bind(total_tests)
        .bind(committed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE analyses SET status = 'failed', error_message = $2, completed_at = now() WHERE id = $1"#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Analysis>> {
        let row = sqlx::query_as::<_, Analysis>(r#"SELECT * FROM analyses WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn latest_completed_for_codebase(&self, codebase_id: Uuid) -> Result<Option<Analysis>> {
        let row = sqlx::query_as::<_, Analysis>(
            r#"
            SELECT * FROM analyses
            WHERE codebase_id = $1 AND status = 'completed'
            ORDER BY completed_at DESC
            LIMIT 1
            "#,
        )
        .bind(codebase_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
