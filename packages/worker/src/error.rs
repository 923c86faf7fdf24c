//! The permanent/retryable distinction the queue runtime needs from every
//! pipeline handler (spec.md §7, "Error handling design").

use thiserror::Error;

/// How the queue runtime should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Never retry regardless of remaining attempts — transitions to `cancelled`.
    Permanent,
    /// Exponential backoff up to `max_attempts`.
    Retryable,
    /// Like `Retryable`, but the caller should restart its subsystem from a
    /// checkpoint on the next attempt rather than resume in place (spec.md
    /// §7: batch-poll budget exhaustion, Phase-1 chunk exhaustion).
    RetryableWithBudget,
}

/// Every sentinel a pipeline handler can produce, carrying enough context to
/// both drive the `queue::HandlerOutcome` decision and to write a
/// human-readable `error_message` onto the owning `Analysis`/`SpecDocument`
/// row (spec.md §7, "User-visible behavior").
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid job arguments: {0}")]
    InvalidInput(String),

    #[error("analysis not found: {0}")]
    AnalysisNotFound(uuid::Uuid),

    #[error("race condition detected: repository identity changed during clone")]
    RaceCondition,

    #[error("clone failed: {0}")]
    CloneFailed(String),

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("save failed: {0}")]
    SaveFailed(String),

    #[error("AI provider unavailable: {0}")]
    AiUnavailable(String),

    #[error("AI provider rate limited: {0}")]
    RateLimited(String),

    #[error("batch job poll budget exhausted (>24h elapsed)")]
    BatchBudgetExhausted,

    #[error("batch job {0} expired or was cancelled")]
    BatchTerminalFailure(String),

    #[error("phase {phase} could not make progress after exhausting sub-retries")]
    PhaseExhausted { phase: &'static str },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Classifies this error for the queue runtime, per spec.md §4.6/§4.8/§7.
    pub fn classify(&self) -> FailureKind {
        match self {
            PipelineError::InvalidInput(_)
            | PipelineError::AnalysisNotFound(_)
            | PipelineError::BatchTerminalFailure(_) => FailureKind::Permanent,

            PipelineError::RaceCondition
            | PipelineError::CloneFailed(_)
            | PipelineError::ScanFailed(_)
            | PipelineError::SaveFailed(_)
            | PipelineError::AiUnavailable(_)
            | PipelineError::RateLimited(_)
            | PipelineError::Other(_) => FailureKind::Retryable,

            PipelineError::BatchBudgetExhausted | PipelineError::PhaseExhausted { .. } => {
                FailureKind::RetryableWithBudget
            }
        }
    }

    /// Converts to the outcome the queue runtime understands, preserving the
    /// permanent/retryable distinction this module exists to encode.
    pub fn into_outcome(self) -> queue::HandlerOutcome {
        match self.classify() {
            FailureKind::Permanent => queue::HandlerOutcome::Cancel(self.to_string()),
            FailureKind::Retryable | FailureKind::RetryableWithBudget => {
                queue::HandlerOutcome::Retry(anyhow::anyhow!(self.to_string()))
            }
        }
    }
}
