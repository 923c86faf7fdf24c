//! Tier Router (spec.md §4.3): a pure function from subscription tier to
//! concrete queue name, plus the lookup glue that turns a `user_id` into a
//! tier without ever failing the caller's enqueue.

use std::sync::Arc;
use uuid::Uuid;

use storage::SubscriptionRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Pro,
    ProPlus,
    Enterprise,
}

impl Tier {
    pub fn is_priority(self) -> bool {
        matches!(self, Tier::Pro | Tier::ProPlus | Tier::Enterprise)
    }

    pub fn is_fairness_exempt(self) -> bool {
        matches!(self, Tier::Pro | Tier::ProPlus | Tier::Enterprise)
    }
}

/// Pure routing rule (spec.md §4.3):
/// - `is_scheduled` takes priority: always `<base>_scheduled`.
/// - Priority tiers: `<base>_priority`.
/// - Otherwise: `<base>_default`.
pub fn route(base_queue: &str, tier: Tier, is_scheduled: bool) -> String {
    if is_scheduled {
        return format!("{base_queue}_scheduled");
    }
    if tier.is_priority() {
        format!("{base_queue}_priority")
    } else {
        format!("{base_queue}_default")
    }
}

/// Resolves `user_id`'s tier from its active subscription, falling back to
/// `Tier::Free` (and a warning log) on any lookup failure — missing
/// subscription, database error, or no `user_id` at all. Never propagates an
/// error up to the enqueue call site (spec.md §4.3: "Never fail the enqueue
/// due to tier ambiguity").
pub async fn resolve_tier(subscriptions: &Arc<dyn SubscriptionRepository>, user_id: Option<Uuid>) -> Tier {
    let Some(user_id) = user_id else {
        return Tier::Free;
    };

    let subscription = match subscriptions.find_active_for_user(user_id).await {
        Ok(Some(s)) => s,
        Ok(None) => return Tier::Free,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "tier lookup failed, routing to default");
            return Tier::Free;
        }
    };

    let plan = match subscriptions.get_plan(subscription.plan_id).await {
        Ok(Some(p)) => p,
        Ok(None) => return Tier::Free,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "plan lookup failed, routing to default");
            return Tier::Free;
        }
    };

    if plan.is_enterprise_tier {
        Tier::Enterprise
    } else if plan.is_pro_tier {
        Tier::Pro
    } else {
        Tier::Free
    }
}

/// Resolves the concrete queue name for an enqueue, combining [`resolve_tier`]
/// and [`route`]. `base_queue` must be `"analysis"` or `"specview"` per
/// spec.md §6 ("Queue naming": the six concrete names).
pub async fn resolve_queue(
    subscriptions: &Arc<dyn SubscriptionRepository>,
    base_queue: &str,
    user_id: Option<Uuid>,
    is_scheduled: bool,
) -> String {
    let tier = resolve_tier(subscriptions, user_id).await;
    route(base_queue, tier, is_scheduled)
}
