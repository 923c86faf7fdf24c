//! TestFile -> TestSuite (tree) -> TestCase inventory persisted per Analysis (spec.md §3, §4.6 step 7).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Active,
    Skipped,
    Todo,
    Focused,
    Xfail,
}

impl CaseStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            CaseStatus::Active => "active",
            CaseStatus::Skipped => "skipped",
            CaseStatus::Todo => "todo",
            CaseStatus::Focused => "focused",
            CaseStatus::Xfail => "xfail",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TestFile {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub path: String,
    pub framework: String,
    pub imports: serde_json::Value,
    pub calls: serde_json::Value,
}

/// A suite node pending insertion. `local_id` is only meaningful within a
/// single inventory batch: the two-pass insert assigns real row ids first,
/// then resolves `parent_local_id` references to `parent_id` columns.
#[derive(Debug, Clone)]
pub struct NewSuite {
    pub local_id: usize,
    pub parent_local_id: Option<usize>,
    pub file_id: Uuid,
    pub name: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TestSuite {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub file_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone)]
pub struct NewCase {
    pub suite_local_id: usize,
    pub name: String,
    pub status: CaseStatus,
    pub modifier: Option<String>,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TestCase {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub suite_id: Uuid,
    pub name: String,
    pub status: String,
    pub modifier: Option<String>,
    pub sort_order: i32,
}

/// The parsed output of a single test file, ready for the two-pass insert.
pub struct FileInventory {
    pub path: String,
    pub framework: String,
    pub imports: serde_json::Value,
    pub calls: serde_json::Value,
    pub suites: Vec<NewSuite>,
    pub cases: Vec<NewCase>,
}

#[async_trait]
pub trait TestTreeRepository: Send + Sync {
    /// Persists an entire inventory for one analysis inside a single
    /// transaction (spec.md §4.6 step 7): insert test_files, then suites
    /// via the two-pass parent assignment, then cases.
    async fn persist_inventory(&self, analysis_id: Uuid, files: Vec<FileInventory>) -> Result<()>;

    async fn list_files(&self, analysis_id: Uuid) -> Result<Vec<TestFile>>;
    async fn list_suites(&self, analysis_id: Uuid) -> Result<Vec<TestSuite>>;
    async fn list_cases(&self, analysis_id: Uuid) -> Result<Vec<TestCase>>;
}

pub struct PgTestTreeRepository {
    pool: PgPool,
}

impl PgTestTreeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_file(tx: &mut Transaction<'_, Postgres>, analysis_id: Uuid, file: &FileInventory) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO test_files (id, analysis_id, path, framework, imports, calls)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(analysis_id)
        .bind(&file.path)
        .bind(&file.framework)
        .bind(&file.imports)
        .bind(&file.calls)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    /// First pass: insert every suite with `parent_id = NULL`, recording the
    /// `local_id -> real id` mapping. Second pass: set `parent_id` for every
    /// suite whose `parent_local_id` is `Some`. This avoids needing topological
    /// insert order, since a suite's parent may appear later in the batch.
    async fn insert_suites(
        tx: &mut Transaction<'_, Postgres>,
        analysis_id: Uuid,
        suites: &[NewSuite],
    ) -> Result<std::collections::HashMap<usize, Uuid>> {
        let mut ids = std::collections::HashMap::with_capacity(suites.len());
        for suite in suites {
            let id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO test_suites (id, analysis_id, file_id, parent_id, name, sort_order)
                VALUES ($1, $2, $3, NULL, $4, $5)
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(analysis_id)
            .bind(suite.file_id)
            .bind(&suite.name)
            .bind(suite.sort_order)
            .fetch_one(&mut **tx)
            .await?;
            ids.insert(suite.local_id, id);
        }

        for suite in suites {
            let Some(parent_local) = suite.parent_local_id else {
                continue;
            };
            let suite_id = ids[&suite.local_id];
            let parent_id = ids[&parent_local];
            sqlx::query(r#"UPDATE test_suites SET parent_id = $2 WHERE id = $1"#)
                .bind(suite_id)
                .bind(parent_id)
                .execute(&mut **tx)
                .await?;
        }

        Ok(ids)
    }

    async fn insert_cases(
        tx: &mut Transaction<'_, Postgres>,
        analysis_id: Uuid,
        cases: &[NewCase],
        suite_ids: &std::collections::HashMap<usize, Uuid>,
    ) -> Result<()> {
        for case in cases {
            let suite_id = suite_ids[&case.suite_local_id];
            sqlx::query(
                r#"
                INSERT INTO test_cases (id, analysis_id, suite_id, name, status, modifier, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(analysis_id)
            .bind(suite_id)
            .bind(&case.name)
            .bind(case.status.as_db_str())
            .bind(&case.modifier)
            .bind(case.sort_order)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TestTreeRepository for PgTestTreeRepository {
    async fn persist_inventory(&self, analysis_id: Uuid, files: Vec<FileInventory>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for file in &files {
            let file_id = Self::insert_file(&mut tx, analysis_id, file).await?;
            let suites: Vec<NewSuite> = file
                .suites
                .iter()
                .cloned()
                .map(|mut s| {
                    s.file_id = file_id;
                    s
                })
                .collect();
            let suite_ids = Self::insert_suites(&mut tx, analysis_id, &suites).await?;
            Self::insert_cases(&mut tx, analysis_id, &file.cases, &suite_ids).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_files(&self, analysis_id: Uuid) -> Result<Vec<TestFile>> {
        let rows = sqlx::query_as::<_, TestFile>(r#"SELECT * FROM test_files WHERE analysis_id = $1"#)
            .bind(analysis_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_suites(&self, analysis_id: Uuid) -> Result<Vec<TestSuite>> {
        let rows = sqlx::query_as::<_, TestSuite>(
            r#"SELECT * FROM test_suites WHERE analysis_id = $1 ORDER BY sort_order"#,
        )
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_cases(&self, analysis_id: Uuid) -> Result<Vec<TestCase>> {
        let rows = sqlx::query_as::<_, TestCase>(
            r#"SELECT * FROM test_cases WHERE analysis_id = $1 ORDER BY sort_order"#,
        )
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
