//! Content-addressed caches that let Phase 1/2 of the SpecView pipeline skip
//! AI calls for unchanged inputs (spec.md §3, §4.8).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// `(file_signature, language, model_id) -> domain/feature assignment`.
/// `file_signature` is a content hash incorporating file path, framework,
/// and the stable-order test-name list (computed by the caller).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClassificationCacheEntry {
    pub id: Uuid,
    pub file_signature: String,
    pub language: String,
    pub model_id: String,
    pub domain_name: String,
    pub feature_name: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ClassificationCacheRepository: Send + Sync {
    async fn get(
        &self,
        file_signature: &str,
        language: &str,
        model_id: &str,
    ) -> Result<Option<ClassificationCacheEntry>>;

    /// Upserts a single file's classification. Called per-file so a partial
    /// Phase-1 failure still preserves progress on the files that finished
    /// before the failure (spec.md §4.8 step 5).
    async fn put(
        &self,
        file_signature: &str,
        language: &str,
        model_id: &str,
        domain_name: &str,
        feature_name: &str,
    ) -> Result<()>;
}

pub struct PgClassificationCacheRepository {
    pool: PgPool,
}

impl PgClassificationCacheRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClassificationCacheRepository for PgClassificationCacheRepository {
    async fn get(
        &self,
        file_signature: &str,
        language: &str,
        model_id: &str,
    ) -> Result<Option<ClassificationCacheEntry>> {
        let row = sqlx::query_as::<_, ClassificationCacheEntry>(
            r#"
            SELECT * FROM classification_cache
            WHERE file_signature = $1 AND language = $2 AND model_id = $3
            "#,
        )
        .bind(file_signature)
        .bind(language)
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn put(
        &self,
        file_signature: &str,
        language: &str,
        model_id: &str,
        domain_name: &str,
        feature_name: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO classification_cache (id, file_signature, language, model_id, domain_name, feature_name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (file_signature, language, model_id)
            DO UPDATE SET domain_name = EXCLUDED.domain_name, feature_name = EXCLUDED.feature_name
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(file_signature)
        .bind(language)
        .bind(model_id)
        .bind(domain_name)
        .bind(feature_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// `cache_key_hash -> converted description`. `cache_key_hash` is the hash of
/// `(original_name, language, model_id)`, computed by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BehaviorCacheEntry {
    pub cache_key_hash: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait BehaviorCacheRepository: Send + Sync {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<BehaviorCacheEntry>>;

    /// Writes a wave's converted behaviors back to the cache before Phase 2
    /// advances to the next wave, so a mid-phase failure leaves the
    /// completed waves' work durable (spec.md §4.8 step 4).
    async fn put_many(&self, entries: &[(String, String)]) -> Result<()>;
}

pub struct PgBehaviorCacheRepository {
    pool: PgPool,
}

impl PgBehaviorCacheRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BehaviorCacheRepository for PgBehaviorCacheRepository {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<BehaviorCacheEntry>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, BehaviorCacheEntry>(
            r#"SELECT * FROM behavior_cache WHERE cache_key_hash = ANY($1)"#,
        )
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn put_many(&self, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (key, description) in entries {
            sqlx::query(
                r#"
                INSERT INTO behavior_cache (cache_key_hash, description, created_at)
                VALUES ($1, $2, now())
                ON CONFLICT (cache_key_hash) DO UPDATE SET description = EXCLUDED.description
                "#,
            )
            .bind(key)
            .bind(description)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
