//! Durable, Postgres-backed job execution runtime.
//!
//! Owns job state transitions, per-tier routing is the caller's concern
//! (see the `worker` crate's tier router), retry with exponential backoff,
//! cooperative suspension via snooze, and cancellation. See spec.md §4.1.

pub mod backoff;
pub mod error;
pub mod handle;
pub mod handler;
pub mod leader;
pub mod middleware;
pub mod postgres;
pub mod row;
pub mod runtime;
pub mod state;
pub mod store;
pub mod unique_key;
pub mod worker_pool;

pub use error::{Error, Result};
pub use handle::Handle;
pub use handler::{FnHandler, JobHandler};
pub use middleware::{Admission, Middleware, NoopMiddleware};
pub use postgres::PgJobStore;
pub use row::{EnqueueOptions, JobRow, UniqueBy};
pub use runtime::{Runtime, ShutdownHandle};
pub use state::{HandlerOutcome, JobState};
pub use store::{ClaimedJob, JobStore, QueueSnapshot};
pub use worker_pool::QueueConfig;
