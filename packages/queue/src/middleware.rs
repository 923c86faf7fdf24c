//! A hook point between "job claimed" and "handler invoked".
//!
//! spec.md §4.2 describes the Fairness Middleware as running "inside the
//! runtime between fetch and handler invocation." The runtime stays
//! ignorant of fairness policy (tiers, caps); it only knows how to call a
//! [`Middleware`] before dispatch and give it a chance to veto (snooze)
//! the attempt.

use async_trait::async_trait;

use crate::row::JobRow;

/// Decision a [`Middleware`] makes before a claimed job reaches its handler.
pub enum Admission {
    /// Proceed to the handler. The `Guard` (if any) is dropped after the
    /// handler returns, regardless of outcome — this is how a fairness
    /// counter releases its slot on success, error, or cancel alike.
    Admit(Option<Box<dyn FnOnce() + Send>>),
    /// Don't run the handler this attempt; re-park the job for `delay`
    /// without consuming a retry attempt.
    Defer(std::time::Duration),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn admit(&self, job: &JobRow) -> Admission;
}

/// A pipeline with no gating — used for queues that don't need fairness
/// admission control (e.g. a test harness, or any queue a deployment opts out).
pub struct NoopMiddleware;

#[async_trait]
impl Middleware for NoopMiddleware {
    async fn admit(&self, _job: &JobRow) -> Admission {
        Admission::Admit(None)
    }
}
