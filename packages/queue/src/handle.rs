//! Read-only queue introspection (SPEC_FULL.md §11, "Queue introspection"),
//! separate from [`crate::runtime::Runtime`] so callers that only want to
//! report backlog size — a dashboard, the leader's own maintenance-loop
//! logging, a test asserting B2 — don't need a handler registry or a
//! worker-pool lifecycle, just the store.

use std::sync::Arc;

use crate::error::Result;
use crate::store::{JobStore, QueueSnapshot};

/// A cheap, cloneable view onto one [`JobStore`] for read-only queries.
/// Construction never fails and never opens a new connection: it shares
/// whatever pool the store already holds.
#[derive(Clone)]
pub struct Handle {
    store: Arc<dyn JobStore>,
}

impl Handle {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// The number of jobs in `queue` that are not yet `running` — i.e. the
    /// backlog a human would call "queue depth": `scheduled + available +
    /// retryable`. Excludes `running` itself (already being worked).
    pub async fn queue_depth(&self, queue: &str) -> Result<i64> {
        let snapshot = self.store.snapshot(queue).await?;
        Ok(snapshot.scheduled + snapshot.available + snapshot.retryable)
    }

    /// Full per-state counts for `queue`.
    pub async fn snapshot(&self, queue: &str) -> Result<QueueSnapshot> {
        self.store.snapshot(queue).await
    }
}
