use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    BatchStatus, Phase1Input, Phase1Output, Phase2Input, Phase2Output, Phase3Input, Phase3Output,
    PlacementInput, PlacementOutput, TokenUsage,
};

/// Provider-agnostic surface the Analyze/SpecView pipelines depend on
/// (spec.md §4.7). Implementations own prompt construction, tolerant
/// response parsing, and truncation/hallucination handling.
#[async_trait]
pub trait AiAdapter: Send + Sync {
    async fn classify_domains(&self, input: Phase1Input) -> Result<(Phase1Output, TokenUsage)>;

    async fn convert_test_names(&self, input: Phase2Input) -> Result<(Phase2Output, TokenUsage)>;

    async fn generate_summary(&self, input: Phase3Input) -> Result<(Phase3Output, TokenUsage)>;

    async fn place_new_tests(&self, input: PlacementInput) -> Result<(PlacementOutput, TokenUsage)>;

    /// Submits a batch job and returns its provider-assigned name. Only
    /// called when batch mode is enabled by config and the job's test count
    /// clears the configured threshold (spec.md §4.7).
    async fn submit_batch_job(&self, input: Phase2Input) -> Result<String>;

    async fn get_batch_status(&self, job_name: &str) -> Result<BatchStatus>;
}
