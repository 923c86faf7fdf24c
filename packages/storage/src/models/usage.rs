//! UsageEvent: a per-user, per-pipeline quota debit (spec.md §3).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventType {
    Analysis,
    Specview,
}

impl UsageEventType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            UsageEventType::Analysis => "analysis",
            UsageEventType::Specview => "specview",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub analysis_id: Option<Uuid>,
    pub document_id: Option<Uuid>,
    pub quota_amount: i32,
    pub created_at: DateTime<Utc>,
}

/// Exactly one of `analysis_id`/`document_id` must be set. Enforced here as
/// a constructor-time check in addition to the database check constraint,
/// so an invalid event never leaves the caller's hands.
pub struct NewUsageEvent {
    pub user_id: Uuid,
    pub event_type: UsageEventType,
    pub analysis_id: Option<Uuid>,
    pub document_id: Option<Uuid>,
    pub quota_amount: i32,
}

impl NewUsageEvent {
    pub fn for_analysis(user_id: Uuid, analysis_id: Uuid, quota_amount: i32) -> Self {
        Self {
            user_id,
            event_type: UsageEventType::Analysis,
            analysis_id: Some(analysis_id),
            document_id: None,
            quota_amount,
        }
    }

    pub fn for_specview(user_id: Uuid, document_id: Uuid, quota_amount: i32) -> Self {
        Self {
            user_id,
            event_type: UsageEventType::Specview,
            analysis_id: None,
            document_id: Some(document_id),
            quota_amount,
        }
    }

    fn validate(&self) -> Result<()> {
        match (self.analysis_id, self.document_id) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(Error::Other(anyhow::anyhow!(
                "usage event must set exactly one of analysis_id or document_id"
            ))),
        }
    }
}

#[async_trait]
pub trait UsageEventRepository: Send + Sync {
    async fn insert(&self, new: NewUsageEvent) -> Result<UsageEvent>;

    /// Sum of `quota_amount` for a user's events of the given type within
    /// the current billing window, used to enforce `Plan` monthly limits.
    async fn monthly_total(
        &self,
        user_id: Uuid,
        event_type: UsageEventType,
        since: DateTime<Utc>,
    ) -> Result<i64>;
}

pub struct PgUsageEventRepository {
    pool: PgPool,
}

impl PgUsageEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageEventRepository for PgUsageEventRepository {
    async fn insert(&self, new: NewUsageEvent) -> Result<UsageEvent> {
        new.validate()?;
        let row = sqlx::query_as::<_, UsageEvent>(
            r#"
            INSERT INTO usage_events (id, user_id, event_type, analysis_id, document_id, quota_amount, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.event_type.as_db_str())
        .bind(new.analysis_id)
        .bind(new.document_id)
        .bind(new.quota_amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn monthly_total(
        &self,
        user_id: Uuid,
        event_type: UsageEventType,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(quota_amount) FROM usage_events
            WHERE user_id = $1 AND event_type = $2 AND created_at >= $3
            "#,
        )
        .bind(user_id)
        .bind(event_type.as_db_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_event_with_neither_link_set() {
        let new = NewUsageEvent {
            user_id: Uuid::new_v4(),
            event_type: UsageEventType::Analysis,
            analysis_id: None,
            document_id: None,
            quota_amount: 1,
        };
        assert!(new.validate().is_err());
    }

    #[test]
    fn rejects_event_with_both_links_set() {
        let new = NewUsageEvent {
            user_id: Uuid::new_v4(),
            event_type: UsageEventType::Analysis,
            analysis_id: Some(Uuid::new_v4()),
            document_id: Some(Uuid::new_v4()),
            quota_amount: 1,
        };
        assert!(new.validate().is_err());
    }

    #[test]
    fn accepts_event_with_exactly_one_link() {
        let new = NewUsageEvent::for_analysis(Uuid::new_v4(), Uuid::new_v4(), 1);
        assert!(new.validate().is_ok());
    }
}
