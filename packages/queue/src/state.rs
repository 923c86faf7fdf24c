//! The job lifecycle state machine.
//!
//! ```text
//! scheduled → available → running → {completed, retryable, cancelled, discarded}
//! retryable → scheduled (at now + backoff)
//! running   → scheduled (snoozed for a computed duration)
//! ```
//!
//! Transitions happen under a row-locked `SELECT ... FOR UPDATE SKIP LOCKED`
//! in [`crate::postgres::PgJobStore`]; this module only defines the vocabulary.

use std::fmt;
use std::time::Duration;

/// A job's position in the lifecycle.
///
/// Stored as the Postgres `job_state` enum (`CREATE TYPE job_state AS ENUM (...)`);
/// the string values below are the wire/db representation and must not change
/// without a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Inserted, not yet due to run (`scheduled_at` in the future).
    Scheduled,
    /// Due to run; eligible to be claimed by a worker.
    Available,
    /// Claimed by a worker and currently executing.
    Running,
    /// Terminal: the handler returned successfully.
    Completed,
    /// Will be retried: the handler returned a retryable error and attempts remain.
    Retryable,
    /// Terminal: the handler (or the runtime) judged the job unrecoverable.
    Cancelled,
    /// Terminal: retries were exhausted.
    Discarded,
}

impl JobState {
    /// Whether this state is terminal (no further transitions happen).
    pub fn is_final(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Discarded
        )
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Cancelled => "cancelled",
            JobState::Discarded => "discarded",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => JobState::Scheduled,
            "available" => JobState::Available,
            "running" => JobState::Running,
            "completed" => JobState::Completed,
            "retryable" => JobState::Retryable,
            "cancelled" => JobState::Cancelled,
            "discarded" => JobState::Discarded,
            _ => return None,
        })
    }

    /// The bitmask position used by unique-key enforcement (see spec.md I6).
    /// Bit order is stable and persisted in `unique_states` bitmasks on job rows.
    pub fn bit(self) -> u8 {
        match self {
            JobState::Scheduled => 1 << 0,
            JobState::Available => 1 << 1,
            JobState::Running => 1 << 2,
            JobState::Completed => 1 << 3,
            JobState::Retryable => 1 << 4,
            JobState::Cancelled => 1 << 5,
            JobState::Discarded => 1 << 6,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

/// Default bitmask for `unique` enqueue options: every non-final state.
/// A job in any of these states blocks a duplicate enqueue from inserting a new row.
pub const DEFAULT_UNIQUE_STATES: u8 = JobState::Scheduled.bit()
    | JobState::Available.bit()
    | JobState::Running.bit()
    | JobState::Retryable.bit();

/// What a handler returns to the runtime once it finishes (or pauses) its work.
///
/// This is the cooperative-suspension primitive from spec.md §4.1/§5: a handler
/// that needs to checkpoint a long external operation returns [`HandlerOutcome::Snooze`]
/// instead of blocking the worker thread.
pub enum HandlerOutcome {
    /// The job is done. Transitions to [`JobState::Completed`].
    Complete,
    /// A transient failure occurred; retry with backoff if attempts remain.
    /// Transitions to [`JobState::Retryable`] (or [`JobState::Discarded`] if
    /// `attempt >= max_attempts`).
    Retry(anyhow::Error),
    /// A permanent failure occurred; never retry regardless of remaining attempts.
    /// Transitions to [`JobState::Cancelled`].
    Cancel(String),
    /// Re-park the job at `now + duration` without incrementing `attempt`.
    /// Transitions to [`JobState::Scheduled`]. The primitive behind the
    /// SpecView batch-mode poll loop (spec.md §4.8).
    Snooze(Duration),
}

impl fmt::Debug for HandlerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutcome::Complete => write!(f, "Complete"),
            HandlerOutcome::Retry(e) => write!(f, "Retry({e})"),
            HandlerOutcome::Cancel(reason) => write!(f, "Cancel({reason})"),
            HandlerOutcome::Snooze(d) => write!(f, "Snooze({d:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_db_strings() {
        for s in [
            JobState::Scheduled,
            JobState::Available,
            JobState::Running,
            JobState::Completed,
            JobState::Retryable,
            JobState::Cancelled,
            JobState::Discarded,
        ] {
            assert_eq!(JobState::from_db_str(s.as_db_str()), Some(s));
        }
    }

    #[test]
    fn final_states_are_exactly_the_terminal_three() {
        assert!(JobState::Completed.is_final());
        assert!(JobState::Cancelled.is_final());
        assert!(JobState::Discarded.is_final());
        assert!(!JobState::Scheduled.is_final());
        assert!(!JobState::Available.is_final());
        assert!(!JobState::Running.is_final());
        assert!(!JobState::Retryable.is_final());
    }

    #[test]
    fn default_unique_states_excludes_final_states() {
        for s in [JobState::Completed, JobState::Cancelled, JobState::Discarded] {
            assert_eq!(DEFAULT_UNIQUE_STATES & s.bit(), 0);
        }
        for s in [
            JobState::Scheduled,
            JobState::Available,
            JobState::Running,
            JobState::Retryable,
        ] {
            assert_ne!(DEFAULT_UNIQUE_STATES & s.bit(), 0);
        }
    }
}
