//! A fixed-size worker pool for a single queue.
//!
//! Each registered queue gets its own pool (spec.md §5: "Each registered
//! queue has its own fixed-size worker pool"). Workers poll `claim_ready`,
//! run the middleware admission check, invoke the handler, and apply the
//! resulting transition. A worker that finds nothing to claim sleeps for a
//! short poll interval before trying again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::handler::JobHandler;
use crate::middleware::{Admission, Middleware};
use crate::state::HandlerOutcome;
use crate::store::JobStore;

/// Per-queue configuration: worker count and poll cadence.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue: String,
    pub workers: usize,
    pub poll_interval: Duration,
    pub claim_batch_size: i64,
}

impl QueueConfig {
    pub fn new(queue: impl Into<String>, workers: usize) -> Self {
        Self {
            queue: queue.into(),
            workers,
            poll_interval: Duration::from_millis(500),
            claim_batch_size: 1,
        }
    }
}

pub struct WorkerPool {
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        worker_id_prefix: &str,
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
        middleware: Arc<dyn Middleware>,
        retry_policy: Arc<dyn RetryPolicy>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut tasks = Vec::with_capacity(config.workers);
        for idx in 0..config.workers {
            let worker_id = format!("{worker_id_prefix}-{}-{idx}", config.queue);
            let store = store.clone();
            let handler = handler.clone();
            let middleware = middleware.clone();
            let retry_policy = retry_policy.clone();
            let shutdown = shutdown.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(async move {
                run_worker(worker_id, config, store, handler, middleware, retry_policy, shutdown).await;
            }));
        }
        Self { tasks }
    }

    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn run_worker(
    worker_id: String,
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    middleware: Arc<dyn Middleware>,
    retry_policy: Arc<dyn RetryPolicy>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let claimed = match store
            .claim_ready(&config.queue, &worker_id, config.claim_batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(queue = %config.queue, error = %e, "claim_ready failed");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        if claimed.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
            continue;
        }

        for claimed_job in claimed {
            let job = claimed_job.row;

            match middleware.admit(&job).await {
                Admission::Defer(delay) => {
                    tracing::debug!(job_id = %job.id, ?delay, "deferred by middleware (fairness)");
                    if let Err(e) = store.snooze(job.id, delay).await {
                        tracing::error!(job_id = %job.id, error = %e, "failed to snooze deferred job");
                    }
                    continue;
                }
                Admission::Admit(release_guard) => {
                    let span = tracing::info_span!("job", job_id = %job.id, kind = %job.kind, attempt = job.attempt);
                    let _enter = span.enter();

                    if shutdown.is_cancelled() {
                        if let Err(e) = store.release_for_shutdown(job.id).await {
                            tracing::error!(job_id = %job.id, error = %e, "failed to release job on shutdown");
                        }
                        if let Some(release) = release_guard {
                            release();
                        }
                        break;
                    }

                    let outcome = handler.handle(&job, shutdown.clone()).await;
                    apply_outcome(&*store, &job, outcome, retry_policy.as_ref()).await;

                    if let Some(release) = release_guard {
                        release();
                    }
                }
            }
        }
    }
}

async fn apply_outcome(
    store: &dyn JobStore,
    job: &crate::row::JobRow,
    outcome: HandlerOutcome,
    retry_policy: &dyn RetryPolicy,
) {
    let result = match outcome {
        HandlerOutcome::Complete => store.mark_completed(job.id).await,
        HandlerOutcome::Retry(err) => {
            store.mark_retryable(job.id, &err.to_string(), retry_policy).await
        }
        HandlerOutcome::Cancel(reason) => store.mark_cancelled(job.id, &reason).await,
        HandlerOutcome::Snooze(duration) => store.snooze(job.id, duration).await,
    };
    if let Err(e) = result {
        tracing::error!(job_id = %job.id, error = %e, "failed to persist job transition");
    }
}
