//! Fairness Middleware (spec.md §4.2): a per-user in-flight counter that
//! gates job start for free-tier users. Runs inside the queue runtime
//! between fetch and handler invocation via [`queue::Middleware`].
//!
//! Cluster-local by design (spec.md §9, Open Questions): the counter lives
//! in this process's memory, so the effective cap across a multi-replica
//! deployment is `cap × replicas`. Correctness is probabilistic but
//! monotone — a user can never exceed that product.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use queue::{Admission, Middleware};

use crate::tier_router::Tier;

/// Job args carry `user_id` and `tier` per spec.md §4.2 ("reads `user_id`
/// and `tier` from the job args"). Both pipelines embed these fields.
#[derive(Debug, serde::Deserialize)]
struct FairnessArgs {
    user_id: Option<Uuid>,
    #[serde(default)]
    tier: Option<String>,
}

fn parse_tier(raw: Option<&str>) -> Tier {
    match raw {
        Some("pro") => Tier::Pro,
        Some("pro_plus") => Tier::ProPlus,
        Some("enterprise") => Tier::Enterprise,
        _ => Tier::Free,
    }
}

/// Default back-off applied when a free-tier user is already at their cap.
const DEFER_DELAY: Duration = Duration::from_secs(5);

pub struct FairnessMiddleware {
    cap: i64,
    defer_delay: Duration,
    in_flight: Arc<DashMap<Uuid, AtomicI64>>,
}

impl FairnessMiddleware {
    pub fn new(cap: i64) -> Self {
        Self {
            cap: cap.max(1),
            defer_delay: DEFER_DELAY,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Current in-flight count for `user_id`, for tests and introspection.
    pub fn current(&self, user_id: Uuid) -> i64 {
        self.in_flight
            .get(&user_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn try_admit(&self, user_id: Uuid) -> bool {
        let counter = self.in_flight.entry(user_id).or_insert_with(|| AtomicI64::new(0));
        loop {
            let current = counter.load(Ordering::SeqCst);
            if current >= self.cap {
                return false;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(in_flight: &Arc<DashMap<Uuid, AtomicI64>>, user_id: Uuid) {
        if let Some(counter) = in_flight.get(&user_id) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Middleware for FairnessMiddleware {
    async fn admit(&self, job: &queue::JobRow) -> Admission {
        let args: FairnessArgs = match serde_json::from_value(job.args.clone()) {
            Ok(a) => a,
            Err(_) => return Admission::Admit(None),
        };

        let Some(user_id) = args.user_id else {
            return Admission::Admit(None);
        };

        let tier = parse_tier(args.tier.as_deref());
        if tier.is_fairness_exempt() {
            return Admission::Admit(None);
        }

        if !self.try_admit(user_id) {
            tracing::debug!(job_id = %job.id, user_id = %user_id, cap = self.cap, "fairness cap reached, deferring");
            return Admission::Defer(self.defer_delay);
        }

        let in_flight = self.in_flight.clone();
        // Released on handler return regardless of outcome (success, error,
        // cancel) — spec.md §4.2: "a deferred release is scheduled on
        // handler return."
        let release = Box::new(move || Self::release(&in_flight, user_id));
        Admission::Admit(Some(release))
    }
}
