//! Per-user history rows (spec.md §4.6 step 7, §4.8 "Persistence"): lightweight
//! append-only logs distinct from [`crate::UsageEvent`] (which drives quota)
//! — these exist purely so a user can list their own past analyses/spec
//! documents without scanning the whole `analyses`/`spec_documents` tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserAnalysisHistoryEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub analysis_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait UserAnalysisHistoryRepository: Send + Sync {
    async fn insert(&self, user_id: Uuid, analysis_id: Uuid) -> Result<UserAnalysisHistoryEntry>;
    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<UserAnalysisHistoryEntry>>;
}

pub struct PgUserAnalysisHistoryRepository {
    pool: PgPool,
}

impl PgUserAnalysisHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserAnalysisHistoryRepository for PgUserAnalysisHistoryRepository {
    async fn insert(&self, user_id: Uuid, analysis_id: Uuid) -> Result<UserAnalysisHistoryEntry> {
        let row = sqlx::query_as::<_, UserAnalysisHistoryEntry>(
            r#"
            INSERT INTO user_analysis_history (id, user_id, analysis_id, created_at)
            VALUES ($1, $2, $3, now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(analysis_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<UserAnalysisHistoryEntry>> {
        let rows = sqlx::query_as::<_, UserAnalysisHistoryEntry>(
            r#"SELECT * FROM user_analysis_history WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSpecviewHistoryEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait UserSpecviewHistoryRepository: Send + Sync {
    async fn insert(&self, user_id: Uuid, document_id: Uuid) -> Result<UserSpecviewHistoryEntry>;
    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<UserSpecviewHistoryEntry>>;
}

pub struct PgUserSpecviewHistoryRepository {
    pool: PgPool,
}

impl PgUserSpecviewHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserSpecviewHistoryRepository for PgUserSpecviewHistoryRepository {
    async fn insert(&self, user_id: Uuid, document_id: Uuid) -> Result<UserSpecviewHistoryEntry> {
        let row = sqlx::query_as::<_, UserSpecviewHistoryEntry>(
            r#"
            INSERT INTO user_specview_history (id, user_id, document_id, created_at)
            VALUES ($1, $2, $3, now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(document_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<UserSpecviewHistoryEntry>> {
        let rows = sqlx::query_as::<_, UserSpecviewHistoryEntry>(
            r#"SELECT * FROM user_specview_history WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
