//! The queue row schema (spec.md §6, "Queue row schema").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::JobState;

/// A single job row, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: Uuid,
    pub kind: String,
    pub queue: String,
    pub state: JobStateWire,
    pub attempt: i16,
    pub max_attempts: i16,
    pub priority: i16,
    /// Caller-supplied arguments. Part of the unique-key computation;
    /// immutable for the job's lifetime (see spec.md Design Notes, "Metadata vs. args").
    pub args: serde_json::Value,
    /// Runtime-internal state (snooze cursors, batch-poll progress). Never
    /// part of the unique key, mutated freely by handlers between attempts.
    pub metadata: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub unique_key: Option<Vec<u8>>,
    pub errors: Vec<JobError>,
}

/// One recorded failure on a job's attempt history (SPEC_FULL.md §11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub attempt: i16,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Newtype so `JobRow` can serialize/deserialize the state column through the
/// same `serde_json` path used for `args`/`metadata` round-trips in tests,
/// while the Postgres store maps to/from the native enum column directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobStateWire(pub JobState);

impl TryFrom<String> for JobStateWire {
    type Error = String;
    fn try_from(s: String) -> Result<Self, String> {
        JobState::from_db_str(&s)
            .map(JobStateWire)
            .ok_or_else(|| format!("unknown job state {s:?}"))
    }
}

impl From<JobStateWire> for String {
    fn from(w: JobStateWire) -> String {
        w.0.as_db_str().to_string()
    }
}

/// Options accepted by [`crate::JobStore::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub queue: String,
    pub max_attempts: i16,
    pub priority: i16,
    /// If set, the enqueue computes a content-derived key from `unique_by`
    /// fields of `args` and silently coalesces with any existing row in a
    /// non-final state sharing that key (spec.md I6).
    pub unique: Option<UniqueBy>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            max_attempts: 3,
            priority: 2,
            unique: None,
            scheduled_at: None,
        }
    }
}

/// Which argument fields participate in the unique key, and which job states
/// the uniqueness constraint applies across.
#[derive(Debug, Clone)]
pub struct UniqueBy {
    pub fields: Vec<&'static str>,
    pub states_bitmask: u8,
}

impl UniqueBy {
    pub fn fields(fields: Vec<&'static str>) -> Self {
        Self {
            fields,
            states_bitmask: crate::state::DEFAULT_UNIQUE_STATES,
        }
    }
}

/// Validate a queue name against spec.md §4.3: `^[A-Za-z0-9_-]+$`, 1..=127 chars.
pub fn validate_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 127
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_colons_and_empty_names() {
        assert!(!validate_queue_name("analysis:priority"));
        assert!(!validate_queue_name(""));
        assert!(validate_queue_name("analysis_priority"));
        assert!(validate_queue_name("analysis-priority"));
    }

    #[test]
    fn state_wire_round_trips() {
        let w = JobStateWire(JobState::Retryable);
        let s: String = w.into();
        assert_eq!(s, "retryable");
        assert_eq!(JobStateWire::try_from(s).unwrap(), w);
    }
}
