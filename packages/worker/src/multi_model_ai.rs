//! Routes each AI phase to its own model (SPEC_FULL.md §10.3:
//! `AI_MODEL_CLASSIFICATION`/`AI_MODEL_CONVERSION`/`AI_MODEL_SUMMARY`), since
//! [`ai::ClaudeAdapter`] is bound to a single model per instance. Phase 2's
//! model also serves `place_new_tests` (incremental placement is a Phase-2
//! variant, spec.md §4.8 "Incremental placement") and the batch path (batch
//! mode only ever submits Phase-2 conversion work, spec.md §4.7).

use async_trait::async_trait;

use ai::types::{
    BatchStatus, Phase1Input, Phase1Output, Phase2Input, Phase2Output, Phase3Input, Phase3Output, PlacementInput,
    PlacementOutput, TokenUsage,
};
use ai::{AiAdapter, Result};

pub struct MultiModelAdapter {
    classification: ai::ClaudeAdapter,
    conversion: ai::ClaudeAdapter,
    summary: ai::ClaudeAdapter,
}

impl MultiModelAdapter {
    pub fn new(classification: ai::ClaudeAdapter, conversion: ai::ClaudeAdapter, summary: ai::ClaudeAdapter) -> Self {
        Self { classification, conversion, summary }
    }
}

#[async_trait]
impl AiAdapter for MultiModelAdapter {
    async fn classify_domains(&self, input: Phase1Input) -> Result<(Phase1Output, TokenUsage)> {
        self.classification.classify_domains(input).await
    }

    async fn convert_test_names(&self, input: Phase2Input) -> Result<(Phase2Output, TokenUsage)> {
        self.conversion.convert_test_names(input).await
    }

    async fn generate_summary(&self, input: Phase3Input) -> Result<(Phase3Output, TokenUsage)> {
        self.summary.generate_summary(input).await
    }

    async fn place_new_tests(&self, input: PlacementInput) -> Result<(PlacementOutput, TokenUsage)> {
        self.conversion.place_new_tests(input).await
    }

    async fn submit_batch_job(&self, input: Phase2Input) -> Result<String> {
        self.conversion.submit_batch_job(input).await
    }

    async fn get_batch_status(&self, job_name: &str) -> Result<BatchStatus> {
        self.conversion.get_batch_status(job_name).await
    }
}
