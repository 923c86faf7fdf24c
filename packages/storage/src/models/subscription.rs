//! Subscription / Plan: per-user billing state consulted by quota checks (spec.md §3).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    /// Null means unlimited.
    pub monthly_analysis_limit: Option<i32>,
    /// Null means unlimited.
    pub monthly_specview_limit: Option<i32>,
    pub is_pro_tier: bool,
    pub is_enterprise_tier: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// At most one row per user may have `status = 'active'` (partial unique
    /// index at the schema level); this returns that row if present.
    async fn find_active_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>>;

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>>;

    async fn insert(&self, user_id: Uuid, plan_id: Uuid) -> Result<Subscription>;

    async fn cancel(&self, id: Uuid) -> Result<()>;
}

pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn find_active_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"SELECT * FROM subscriptions WHERE user_id = $1 AND status = 'active'"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>> {
        let row = sqlx::query_as::<_, Plan>(r#"SELECT * FROM plans WHERE id = $1"#)
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert(&self, user_id: Uuid, plan_id: Uuid) -> Result<Subscription> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (id, user_id, plan_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'active', now(), now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn cancel(&self, id: Uuid) -> Result<()> {
        sqlx::query(r#"UPDATE subscriptions SET status = 'canceled', updated_at = now() WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
