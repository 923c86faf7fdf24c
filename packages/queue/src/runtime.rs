//! The public entry point: register handlers per job kind, then `run()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::{QuadraticBackoff, RetryPolicy};
use crate::error::Result;
use crate::handle::Handle;
use crate::handler::JobHandler;
use crate::leader::{run_maintenance_loop, MaintenanceConfig};
use crate::middleware::{Middleware, NoopMiddleware};
use crate::row::EnqueueOptions;
use crate::store::JobStore;
use crate::worker_pool::{QueueConfig, WorkerPool};

struct Registration {
    handler: Arc<dyn JobHandler>,
    config: QueueConfig,
}

/// Owns the set of registered job kinds and drives their worker pools.
///
/// Construct with [`Runtime::new`], call [`Runtime::register_worker`] for
/// each job kind, then [`Runtime::run`]. `run()` blocks until
/// [`Runtime::shutdown`] is called from another task (or the process
/// receives a shutdown signal the caller wires up itself).
pub struct Runtime {
    store: Arc<dyn JobStore>,
    middleware: Arc<dyn Middleware>,
    retry_policy: Arc<dyn RetryPolicy>,
    registrations: HashMap<String, Registration>,
    instance_id: String,
    shutdown: CancellationToken,
}

impl Runtime {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            middleware: Arc::new(NoopMiddleware),
            retry_policy: Arc::new(QuadraticBackoff),
            registrations: HashMap::new(),
            instance_id: Uuid::new_v4().to_string(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Register a handler for `kind`, serving the named `queue_config.queue`
    /// with `queue_config.workers` parallel workers.
    pub fn register_worker(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        queue_config: QueueConfig,
    ) {
        self.registrations.insert(
            kind.into(),
            Registration {
                handler,
                config: queue_config,
            },
        );
    }

    pub async fn enqueue(
        &self,
        kind: &str,
        args: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Uuid> {
        self.store.enqueue(kind, args, opts).await
    }

    /// Start every registered worker pool plus the leader-maintenance loop.
    /// Blocks until [`Runtime::shutdown`] is invoked.
    pub async fn run(self) {
        let mut pools = Vec::new();
        let queues: Vec<String> = self
            .registrations
            .values()
            .map(|r| r.config.queue.clone())
            .collect();

        for (kind, registration) in &self.registrations {
            tracing::info!(
                kind = %kind,
                queue = %registration.config.queue,
                workers = registration.config.workers,
                "starting worker pool"
            );
            pools.push(WorkerPool::spawn(
                &self.instance_id,
                registration.config.clone(),
                self.store.clone(),
                registration.handler.clone(),
                self.middleware.clone(),
                self.retry_policy.clone(),
                self.shutdown.clone(),
            ));
        }

        let maintenance = tokio::spawn(run_maintenance_loop(
            self.store.clone(),
            MaintenanceConfig::new(self.instance_id.clone(), queues),
            self.shutdown.clone(),
        ));

        self.shutdown.cancelled().await;

        for pool in pools {
            pool.join().await;
        }
        let _ = maintenance.await;
    }

    /// Returns a handle that can be used to trigger shutdown from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Returns a read-only introspection handle (queue depth, per-state
    /// snapshot) sharing this runtime's store.
    pub fn handle(&self) -> Handle {
        Handle::new(self.store.clone())
    }
}

#[derive(Clone)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    /// Stop fetching new jobs and begin winding down. `grace_period` is
    /// currently advisory — workers observe the cancellation token at their
    /// next suspension point, which in practice happens well inside typical
    /// grace periods for this workload (database calls, HTTP calls).
    pub async fn shutdown(&self, grace_period: Duration) {
        self.0.cancel();
        tokio::time::sleep(grace_period.min(Duration::from_secs(1))).await;
    }
}
