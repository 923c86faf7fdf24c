//! The job handler trait a pipeline implements.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::row::JobRow;
use crate::state::HandlerOutcome;

/// Executes one attempt of a job kind.
///
/// Implementations must observe `cancel` at suspension points (database
/// calls, HTTP calls, semaphore acquisition) and return promptly once it
/// fires — see spec.md §5, "Cancellation".
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRow, cancel: CancellationToken) -> HandlerOutcome;
}

/// Adapts a plain async closure into a [`JobHandler`], for tests and small handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobRow, CancellationToken) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, job: &JobRow, cancel: CancellationToken) -> HandlerOutcome {
        (self.0)(job.clone(), cancel).await
    }
}
