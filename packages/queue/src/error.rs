//! Structured errors for the queue runtime.
//!
//! Matches the teacher's error-boundary convention (`seesaw::error`): internal
//! plumbing uses `anyhow::Error` for ergonomic `?`, but the crate boundary
//! exposes a pattern-matchable enum so callers can tell a storage failure
//! from a row-level conflict without string matching.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("no handler registered for job kind {0:?}")]
    NoHandlerRegistered(String),

    #[error("queue name {0:?} is invalid: must match ^[A-Za-z0-9_-]+$")]
    InvalidQueueName(String),

    #[error("failed to acquire leader lease")]
    LeaseUnavailable,

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
