//! SpecDocument -> SpecDomain -> SpecFeature -> SpecBehavior tree (spec.md §3, §4.8).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpecDocument {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content_hash: String,
    pub language: String,
    pub model_id: String,
    pub version: i32,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDomain {
    pub local_id: usize,
    pub name: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpecDomain {
    pub id: Uuid,
    pub document_id: Uuid,
    pub name: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone)]
pub struct NewFeature {
    pub local_id: usize,
    pub domain_local_id: usize,
    pub name: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpecFeature {
    pub id: Uuid,
    pub document_id: Uuid,
    pub domain_id: Uuid,
    pub name: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone)]
pub struct NewBehavior {
    pub feature_local_id: usize,
    pub description: String,
    /// Link to the source test case this behavior was converted from.
    /// `ON DELETE SET NULL` at the schema level preserves the prose after
    /// the test is deleted (spec.md §3).
    pub source_test_case_id: Option<Uuid>,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpecBehavior {
    pub id: Uuid,
    pub document_id: Uuid,
    pub feature_id: Uuid,
    pub description: String,
    pub source_test_case_id: Option<Uuid>,
    pub sort_order: i32,
}

pub struct NewDocumentTree {
    pub user_id: Uuid,
    pub content_hash: String,
    pub language: String,
    pub model_id: String,
    pub version: i32,
    pub summary: String,
    pub domains: Vec<NewDomain>,
    pub features: Vec<NewFeature>,
    pub behaviors: Vec<NewBehavior>,
}

#[async_trait]
pub trait SpecDocumentRepository: Send + Sync {
    /// `(user_id, content_hash, language, model_id, version)` cache lookup
    /// used by the SpecView pipeline's content-hash hit path (spec.md §4.8).
    async fn find_by_key(
        &self,
        user_id: Uuid,
        content_hash: &str,
        language: &str,
        model_id: &str,
        version: i32,
    ) -> Result<Option<SpecDocument>>;

    /// Writes the full Document -> Domain -> Feature -> Behavior tree in one
    /// transaction, preserving sort order at each level.
    async fn insert_tree(&self, tree: NewDocumentTree) -> Result<SpecDocument>;

    async fn get(&self, id: Uuid) -> Result<Option<SpecDocument>>;
    async fn list_domains(&self, document_id: Uuid) -> Result<Vec<SpecDomain>>;
    async fn list_features(&self, document_id: Uuid) -> Result<Vec<SpecFeature>>;
    async fn list_behaviors(&self, document_id: Uuid) -> Result<Vec<SpecBehavior>>;
}

pub struct PgSpecDocumentRepository {
    pool: PgPool,
}

impl PgSpecDocumentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_domains(
        tx: &mut Transaction<'_, Postgres>,
        document_id: Uuid,
        domains: &[NewDomain],
    ) -> Result<std::collections::HashMap<usize, Uuid>> {
        let mut ids = std::collections::HashMap::with_capacity(domains.len());
        for d in domains {
            let id: Uuid = sqlx::query_scalar(
                r#"INSERT INTO spec_domains (id, document_id, name, sort_order) VALUES ($1, $2, $3, $4) RETURNING id"#,
            )
            .bind(Uuid::new_v4())
            .bind(document_id)
            .bind(&d.name)
            .bind(d.sort_order)
            .fetch_one(&mut **tx)
            .await?;
            ids.insert(d.local_id, id);
        }
        Ok(ids)
    }

    async fn insert_features(
        tx: &mut Transaction<'_, Postgres>,
        document_id: Uuid,
        features: &[NewFeature],
        domain_ids: &std::collections::HashMap<usize, Uuid>,
    ) -> Result<std::collections::HashMap<usize, Uuid>> {
        let mut ids = std::collections::HashMap::with_capacity(features.len());
        for f in features {
            let domain_id = domain_ids[&f.domain_local_id];
            let id: Uuid = sqlx::query_scalar(
                r#"INSERT INTO spec_features (id, document_id, domain_id, name, sort_order) VALUES ($1, $2, $3, $4, $5) RETURNING id"#,
            )
            .bind(Uuid::new_v4())
            .bind(document_id)
            .bind(domain_id)
            .bind(&f.name)
            .bind(f.sort_order)
            .fetch_one(&mut **tx)
            .await?;
            ids.insert(f.local_id, id);
        }
        Ok(ids)
    }

    async fn insert_behaviors(
        tx: &mut Transaction<'_, Postgres>,
        document_id: Uuid,
        behaviors: &[NewBehavior],
        feature_ids: &std::collections::HashMap<usize, Uuid>,
    ) -> Result<()> {
        for b in behaviors {
            let feature_id = feature_ids[&b.feature_local_id];
            sqlx::query(
                r#"
                INSERT INTO spec_behaviors (id, document_id, feature_id, description, source_test_case_id, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(document_id)
            .bind(feature_id)
            .bind(&b.description)
            .bind(b.source_test_case_id)
            .bind(b.sort_order)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SpecDocumentRepository for PgSpecDocumentRepository {
    async fn find_by_key(
        &self,
        user_id: Uuid,
        content_hash: &str,
        language: &str,
        model_id: &str,
        version: i32,
    ) -> Result<Option<SpecDocument>> {
        let row = sqlx::query_as::<_, SpecDocument>(
            r#"
            SELECT * FROM spec_documents
            WHERE user_id = $1 AND content_hash = $2 AND language = $3 AND model_id = $4 AND version = $5
            "#,
        )
        .bind(user_id)
        .bind(content_hash)
        .bind(language)
        .bind(model_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_tree(&self, tree: NewDocumentTree) -> Result<SpecDocument> {
        let mut tx = self.pool.begin().await?;

        let document = sqlx::query_as::<_, SpecDocument>(
            r#"
            INSERT INTO spec_documents (id, user_id, content_hash, language, model_id, version, summary, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tree.user_id)
        .bind(&tree.content_hash)
        .bind(&tree.language)
        .bind(&tree.model_id)
        .bind(tree.version)
        .bind(&tree.summary)
        .fetch_one(&mut *tx)
        .await?;

        let domain_ids = Self::insert_domains(&mut tx, document.id, &tree.domains).await?;
        let feature_ids = Self::insert_features(&mut tx, document.id, &tree.features, &domain_ids).await?;
        Self::insert_behaviors(&mut tx, document.id, &tree.behaviors, &feature_ids).await?;

        tx.commit().await?;
        Ok(document)
    }

    async fn get(&self, id: Uuid) -> Result<Option<SpecDocument>> {
        let row = sqlx::query_as::<_, SpecDocument>(r#"SELECT * FROM spec_documents WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_domains(&self, document_id: Uuid) -> Result<Vec<SpecDomain>> {
        let rows = sqlx::query_as::<_, SpecDomain>(
            r#"SELECT * FROM spec_domains WHERE document_id = $1 ORDER BY sort_order"#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_features(&self, document_id: Uuid) -> Result<Vec<SpecFeature>> {
        let rows = sqlx::query_as::<_, SpecFeature>(
            r#"SELECT * FROM spec_features WHERE document_id = $1 ORDER BY sort_order"#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_behaviors(&self, document_id: Uuid) -> Result<Vec<SpecBehavior>> {
        let rows = sqlx::query_as::<_, SpecBehavior>(
            r#"SELECT * FROM spec_behaviors WHERE document_id = $1 ORDER BY sort_order"#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
