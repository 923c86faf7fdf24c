//! Codebase: a durable identity for a source repository (spec.md §3, §4.4).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Codebase {
    pub id: Uuid,
    pub host: String,
    pub owner: String,
    pub name: String,
    pub external_repo_id: String,
    pub default_branch: Option<String>,
    pub is_private: bool,
    pub is_stale: bool,
    /// Last SHA this codebase was analyzed at, used by the identity resolver's
    /// step 1 short-circuit (spec.md §4.4) to avoid a hosting-provider round trip.
    pub last_commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCodebase {
    pub host: String,
    pub owner: String,
    pub name: String,
    pub external_repo_id: String,
    pub is_private: bool,
}

#[async_trait]
pub trait CodebaseRepository: Send + Sync {
    /// `(host, owner, name)` lookup, ignoring staleness — used by identity
    /// resolver step 1. Invariant I2 guarantees at most one non-stale row
    /// matches, but a stale row may also match during the race window.
    async fn find_by_path(&self, host: &str, owner: &str, name: &str) -> Result<Option<Codebase>>;

    async fn find_by_external_id(&self, host: &str, external_repo_id: &str) -> Result<Option<Codebase>>;

    async fn insert(&self, new: NewCodebase) -> Result<Codebase>;

    async fn mark_stale(&self, id: Uuid) -> Result<()>;

    async fn update_owner_name(&self, id: Uuid, owner: &str, name: &str) -> Result<()>;

    async fn update_privacy_and_commit(&self, id: Uuid, is_private: bool, last_commit_sha: &str) -> Result<()>;

    async fn unmark_stale(&self, id: Uuid) -> Result<()>;
}

pub struct PgCodebaseRepository {
    pool: PgPool,
}

impl PgCodebaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CodebaseRepository for PgCodebaseRepository {
    async fn find_by_path(&self, host: &str, owner: &str, name: &str) -> Result<Option<Codebase>> {
        let row = sqlx::query_as::<_, Codebase>(
            r#"
            SELECT * FROM codebases
            WHERE host = $1 AND lower(owner) = lower($2) AND lower(name) = lower($3)
            ORDER BY is_stale ASC, updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(host)
        .bind(owner)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_external_id(&self, host: &str, external_repo_id: &str) -> Result<Option<Codebase>> {
        let row = sqlx::query_as::<_, Codebase>(
            r#"SELECT * FROM codebases WHERE host = $1 AND external_repo_id = $2"#,
        )
        .bind(host)
        .bind(external_repo_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert(&self, new: NewCodebase) -> Result<Codebase> {
        let row = sqlx::query_as::<_, Codebase>(
            r#"
            INSERT INTO codebases (id, host, owner, name, external_repo_id, is_private, is_stale, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, now(), now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.host)
        .bind(&new.owner)
        .bind(&new.name)
        .bind(&new.external_repo_id)
        .bind(new.is_private)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_stale(&self, id: Uuid) -> Result<()> {
        sqlx::query(r#"UPDATE codebases SET is_stale = TRUE, updated_at = now() WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_owner_name(&self, id: Uuid, owner: &str, name: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE codebases SET owner = $2, name = $3, updated_at = now() WHERE id = $1"#,
        )
        .bind(id)
        .bind(owner)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_privacy_and_commit(&self, id: Uuid, is_private: bool, last_commit_sha: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE codebases SET is_private = $2, last_commit_sha = $3, updated_at = now() WHERE id = $1"#,
        )
        .bind(id)
        .bind(is_private)
        .bind(last_commit_sha)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unmark_stale(&self, id: Uuid) -> Result<()> {
        sqlx::query(r#"UPDATE codebases SET is_stale = FALSE, updated_at = now() WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
