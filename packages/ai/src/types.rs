//! Request/response shapes for the four AI phases (spec.md §4.7).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

// ---- Phase 1: classify_domains ----

#[derive(Debug, Clone, Serialize)]
pub struct FileHint {
    pub index: usize,
    pub path: String,
    pub test_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Phase1Input {
    pub files: Vec<FileHint>,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Phase1Feature {
    pub name: String,
    pub test_indices: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Phase1Domain {
    pub name: String,
    #[serde(default)]
    pub confidence: f32,
    pub features: Vec<Phase1Feature>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Phase1Output {
    #[serde(default)]
    pub domains: Vec<Phase1Domain>,
}

// ---- Phase 2: convert_test_names ----

#[derive(Debug, Clone, Serialize)]
pub struct TestNameInput {
    pub index: usize,
    pub original_name: String,
    pub context: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Phase2Input {
    pub tests: Vec<TestNameInput>,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Phase2Behavior {
    pub test_index: i64,
    pub description: String,
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Phase2Output {
    #[serde(default)]
    pub behaviors: Vec<Phase2Behavior>,
}

// ---- Phase 3: generate_summary ----

#[derive(Debug, Clone, Serialize)]
pub struct Phase3Input {
    pub domain_names: Vec<String>,
    pub total_behaviors: usize,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Phase3Output {
    pub summary: String,
}

// ---- Incremental placement ----

#[derive(Debug, Clone, Serialize)]
pub struct PlacementInput {
    pub new_tests: Vec<TestNameInput>,
    pub existing_domains: Vec<Phase1Domain>,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlacementAssignment {
    pub test_index: i64,
    pub domain_name: String,
    pub feature_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlacementOutput {
    #[serde(default)]
    pub assignments: Vec<PlacementAssignment>,
}

// ---- Batch mode ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStatus {
    pub state: Option<BatchState>,
    pub responses: Option<Vec<String>>,
    pub token_usage: Option<TokenUsage>,
}
