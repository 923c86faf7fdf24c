//! SpecView Pipeline (spec.md §4.8): handler for the `specview:generate` job
//! kind. Three-phase AI synthesis (classification, behavior conversion,
//! summary) over an analysis's test inventory, with content-hash caching at
//! the document, file, and individual-test granularity, and an optional
//! asynchronous batch-API path for Phase 2 that suspends the job via
//! `HandlerOutcome::Snooze` instead of blocking a worker on a long poll.
//!
//! Classification (Phase 1) always runs synchronously and is cached at file
//! granularity; only Phase 2 (behavior conversion) ever attaches to the
//! batch API, since that is the phase the AI adapter's `submit_batch_job`
//! takes as input. This keeps the full domain/feature taxonomy re-derivable
//! from the classification cache alone on every resumption, so the
//! multi-invocation cursor only ever needs to track the Phase 2 batch job.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ai::AiAdapter;
use queue::{HandlerOutcome, JobHandler, JobRow, JobStore};
use storage::{
    AnalysisRepository, BehaviorCacheRepository, ClassificationCacheRepository, NewBehavior, NewDocumentTree,
    NewDomain, NewFeature, NewUsageEvent, SpecDocumentRepository, TestTreeRepository, UserSpecviewHistoryRepository,
};

use crate::error::PipelineError;
use crate::tier_router::Tier;

const DOCUMENT_VERSION: i32 = 1;
const FILES_PER_CLASSIFY_CHUNK: usize = 20;
const TESTS_PER_CONVERT_WAVE: usize = 20;

/// Job args for `specview:generate` (spec.md §4.8: "Job args:
/// `{analysis_id, language, user_id, model_id?, force_regenerate?}`.").
#[derive(Debug, Clone, Deserialize)]
pub struct SpecviewArgs {
    pub analysis_id: Uuid,
    pub language: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub force_regenerate: Option<bool>,
    #[serde(default)]
    pub tier: Option<String>,
}

impl SpecviewArgs {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.language.trim().is_empty() {
            return Err(PipelineError::InvalidInput("language is required".into()));
        }
        Ok(())
    }
}

fn parse_tier_arg(raw: Option<&str>) -> Tier {
    match raw {
        Some("pro") => Tier::Pro,
        Some("pro_plus") => Tier::ProPlus,
        Some("enterprise") => Tier::Enterprise,
        _ => Tier::Free,
    }
}

/// The job-local cap on concurrent Phase 2 conversion waves, scaled by tier
/// so a Free-tier document doesn't starve the worker pool's other jobs.
fn phase2_concurrency(tier: Tier) -> usize {
    match tier {
        Tier::Free => 2,
        Tier::Pro => 4,
        Tier::ProPlus => 6,
        Tier::Enterprise => 8,
    }
}

/// A flattened, file-ordered test case, numbered once up front so every
/// downstream phase can correlate AI responses back to a `TestCase` row by
/// a plain integer instead of carrying the full row around.
#[derive(Debug, Clone)]
struct TestEntry {
    index: usize,
    case_id: Uuid,
    original_name: String,
    file_path: String,
}

/// One source file's tests, grouped for Phase 1. Classification happens at
/// this granularity because the classification cache schema stores exactly
/// one `(domain_name, feature_name)` pair per `file_signature`.
#[derive(Debug, Clone)]
struct FileGroup {
    path: String,
    signature: String,
    test_indices: Vec<usize>,
}

#[derive(Debug, Clone)]
struct ClassificationResult {
    domain_name: String,
    feature_name: String,
}

fn fallback_classification() -> ClassificationResult {
    ClassificationResult {
        domain_name: "General".to_string(),
        feature_name: "Uncategorized".to_string(),
    }
}

fn majority_vote(votes: &[(String, String)]) -> ClassificationResult {
    let mut counts: HashMap<(String, String), usize> = HashMap::new();
    for v in votes {
        *counts.entry(v.clone()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, c)| *c)
        .map(|((domain_name, feature_name), _)| ClassificationResult { domain_name, feature_name })
        .unwrap_or_else(fallback_classification)
}

/// Content hash for the document-level cache hit (spec.md §4.8 step 1):
/// language, model, and every file's signature, order-independent so
/// unrelated file-list reordering doesn't defeat the cache.
fn content_hash(file_signatures: &[String], language: &str, model_id: &str) -> String {
    let mut sorted = file_signatures.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(language.as_bytes());
    hasher.update([0u8]);
    hasher.update(model_id.as_bytes());
    hasher.update([0u8]);
    for sig in &sorted {
        hasher.update(sig.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn file_signature(path: &str, framework: &str, test_names: &[String]) -> String {
    let mut sorted = test_names.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(framework.as_bytes());
    hasher.update([0u8]);
    for name in &sorted {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn behavior_cache_key(original_name: &str, language: &str, model_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(original_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(language.as_bytes());
    hasher.update([0u8]);
    hasher.update(model_id.as_bytes());
    hex::encode(hasher.finalize())
}

fn batch_budget_exceeded(started: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - started > chrono::Duration::hours(24)
}

fn map_ai_error(e: ai::Error) -> PipelineError {
    match e {
        ai::Error::Provider(msg) => PipelineError::AiUnavailable(msg),
        ai::Error::Truncated => PipelineError::AiUnavailable("response truncated".to_string()),
        ai::Error::Parse(msg) => PipelineError::AiUnavailable(format!("unparseable AI response: {msg}")),
        ai::Error::BatchNotFound(name) => PipelineError::BatchTerminalFailure(name),
        ai::Error::Other(err) => PipelineError::AiUnavailable(err.to_string()),
    }
}

/// Durable cursor for the Phase 2 batch-mode poll loop, round-tripped through
/// the job's `metadata` column between invocations (spec.md Design Notes,
/// "Metadata vs. args").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BatchCursor {
    batch_job_name: Option<String>,
    batch_started: Option<DateTime<Utc>>,
}

enum BatchStep {
    Snoozed(Duration),
    Done(HashMap<usize, String>),
}

enum PipelineCompletion {
    Done,
    Snoozed(Duration),
}

pub struct SpecviewPipeline {
    analyses: Arc<dyn AnalysisRepository>,
    test_trees: Arc<dyn TestTreeRepository>,
    classification_cache: Arc<dyn ClassificationCacheRepository>,
    behavior_cache: Arc<dyn BehaviorCacheRepository>,
    spec_documents: Arc<dyn SpecDocumentRepository>,
    history: Arc<dyn UserSpecviewHistoryRepository>,
    usage_events: Arc<dyn storage::UsageEventRepository>,
    ai: Arc<dyn AiAdapter>,
    job_store: Arc<dyn JobStore>,
    default_model_id: String,
    use_batch_api: bool,
    batch_threshold: usize,
    batch_poll_interval: Duration,
    job_timeout: Duration,
}

impl SpecviewPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        analyses: Arc<dyn AnalysisRepository>,
        test_trees: Arc<dyn TestTreeRepository>,
        classification_cache: Arc<dyn ClassificationCacheRepository>,
        behavior_cache: Arc<dyn BehaviorCacheRepository>,
        spec_documents: Arc<dyn SpecDocumentRepository>,
        history: Arc<dyn UserSpecviewHistoryRepository>,
        usage_events: Arc<dyn storage::UsageEventRepository>,
        ai: Arc<dyn AiAdapter>,
        job_store: Arc<dyn JobStore>,
        default_model_id: impl Into<String>,
        use_batch_api: bool,
        batch_threshold: usize,
        batch_poll_interval: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            analyses,
            test_trees,
            classification_cache,
            behavior_cache,
            spec_documents,
            history,
            usage_events,
            ai,
            job_store,
            default_model_id: default_model_id.into(),
            use_batch_api,
            batch_threshold,
            batch_poll_interval,
            job_timeout,
        }
    }

    async fn run(&self, job: &JobRow) -> Result<PipelineCompletion, PipelineError> {
        let args: SpecviewArgs =
            serde_json::from_value(job.args.clone()).map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
        args.validate()?;

        tokio::time::timeout(self.job_timeout, self.run_inner(job, args))
            .await
            .map_err(|_| PipelineError::Other(anyhow::anyhow!("specview job exceeded its timeout budget")))?
    }

    async fn run_inner(&self, job: &JobRow, args: SpecviewArgs) -> Result<PipelineCompletion, PipelineError> {
        let _analysis = self
            .analyses
            .get(args.analysis_id)
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?
            .ok_or(PipelineError::AnalysisNotFound(args.analysis_id))?;

        let model_id = args.model_id.clone().unwrap_or_else(|| self.default_model_id.clone());
        let force_regenerate = args.force_regenerate.unwrap_or(false);

        let (tests, groups) = self.load_tests(args.analysis_id).await?;
        let signatures: Vec<String> = groups.iter().map(|g| g.signature.clone()).collect();
        let hash = content_hash(&signatures, &args.language, &model_id);

        if !force_regenerate {
            if let Some(doc) = self
                .spec_documents
                .find_by_key(args.user_id, &hash, &args.language, &model_id, DOCUMENT_VERSION)
                .await
                .map_err(|e| PipelineError::SaveFailed(e.to_string()))?
            {
                tracing::info!(
                    document_id = %doc.id,
                    analysis_id = %args.analysis_id,
                    "specview content hash matched an existing document, skipping synthesis"
                );
                return Ok(PipelineCompletion::Done);
            }
        }

        let classifications = self.classify(&groups, &tests, &args.language, &model_id).await?;

        let behavior_keys: Vec<String> = tests
            .iter()
            .map(|t| behavior_cache_key(&t.original_name, &args.language, &model_id))
            .collect();
        let cached_entries = self
            .behavior_cache
            .get_many(&behavior_keys)
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;
        let cached_by_key: HashMap<String, String> =
            cached_entries.into_iter().map(|e| (e.cache_key_hash, e.description)).collect();

        let mut behaviors: HashMap<usize, String> = HashMap::new();
        let mut uncached: Vec<&TestEntry> = Vec::new();
        for (test, key) in tests.iter().zip(behavior_keys.iter()) {
            match cached_by_key.get(key) {
                Some(desc) => {
                    behaviors.insert(test.index, desc.clone());
                }
                None => uncached.push(test),
            }
        }

        let quota_amount = uncached.len() as i32;

        if !uncached.is_empty() {
            let use_batch = self.use_batch_api && uncached.len() >= self.batch_threshold;
            if use_batch {
                let cursor: BatchCursor = serde_json::from_value(job.metadata.clone()).unwrap_or_default();
                match self.run_phase2_batch(job, &args, &model_id, &uncached, cursor).await? {
                    BatchStep::Snoozed(delay) => return Ok(PipelineCompletion::Snoozed(delay)),
                    BatchStep::Done(new_behaviors) => behaviors.extend(new_behaviors),
                }
            } else {
                let tier = parse_tier_arg(args.tier.as_deref());
                let new_behaviors = self
                    .convert_waves(&uncached, &args.language, &model_id, phase2_concurrency(tier))
                    .await?;
                behaviors.extend(new_behaviors);
            }
        }

        self.finish(&args, &model_id, &hash, &groups, &classifications, &tests, &behaviors, quota_amount)
            .await?;
        Ok(PipelineCompletion::Done)
    }

    async fn load_tests(&self, analysis_id: Uuid) -> Result<(Vec<TestEntry>, Vec<FileGroup>), PipelineError> {
        let files = self
            .test_trees
            .list_files(analysis_id)
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;
        let suites = self
            .test_trees
            .list_suites(analysis_id)
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;
        let cases = self
            .test_trees
            .list_cases(analysis_id)
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;

        let suite_file: HashMap<Uuid, Uuid> = suites.iter().map(|s| (s.id, s.file_id)).collect();

        let mut by_file: HashMap<Uuid, Vec<&storage::TestCase>> = HashMap::new();
        for case in &cases {
            if let Some(file_id) = suite_file.get(&case.suite_id) {
                by_file.entry(*file_id).or_default().push(case);
            }
        }

        let mut sorted_files = files.clone();
        sorted_files.sort_by(|a, b| a.path.cmp(&b.path));

        let mut tests = Vec::new();
        let mut groups = Vec::with_capacity(sorted_files.len());
        for file in &sorted_files {
            let mut file_cases = by_file.remove(&file.id).unwrap_or_default();
            file_cases.sort_by_key(|c| c.sort_order);

            let mut indices = Vec::with_capacity(file_cases.len());
            let mut names = Vec::with_capacity(file_cases.len());
            for case in file_cases {
                let index = tests.len();
                tests.push(TestEntry {
                    index,
                    case_id: case.id,
                    original_name: case.name.clone(),
                    file_path: file.path.clone(),
                });
                indices.push(index);
                names.push(case.name.clone());
            }

            groups.push(FileGroup {
                path: file.path.clone(),
                signature: file_signature(&file.path, &file.framework, &names),
                test_indices: indices,
            });
        }

        Ok((tests, groups))
    }

    /// Phase 1 (spec.md §4.8 step 2): per-file classification cache lookup,
    /// then either `place_new_tests` against the taxonomy already known from
    /// this run's cache hits (incremental placement, substituting for a
    /// predecessor-document diff the storage layer has no cheap link for) or
    /// a full chunked `classify_domains` bootstrap when nothing is cached yet.
    async fn classify(
        &self,
        groups: &[FileGroup],
        tests: &[TestEntry],
        language: &str,
        model_id: &str,
    ) -> Result<Vec<ClassificationResult>, PipelineError> {
        let mut results: Vec<Option<ClassificationResult>> = vec![None; groups.len()];
        let mut uncached_idx = Vec::new();

        for (i, group) in groups.iter().enumerate() {
            match self
                .classification_cache
                .get(&group.signature, language, model_id)
                .await
                .map_err(|e| PipelineError::SaveFailed(e.to_string()))?
            {
                Some(entry) => {
                    results[i] = Some(ClassificationResult {
                        domain_name: entry.domain_name,
                        feature_name: entry.feature_name,
                    })
                }
                None => uncached_idx.push(i),
            }
        }

        if !uncached_idx.is_empty() {
            let mut existing: HashMap<String, std::collections::HashSet<String>> = HashMap::new();
            for r in results.iter().flatten() {
                existing.entry(r.domain_name.clone()).or_default().insert(r.feature_name.clone());
            }

            if existing.is_empty() {
                self.bootstrap_classify(groups, tests, &uncached_idx, language, model_id, &mut results)
                    .await?;
            } else {
                let existing_domains: Vec<ai::types::Phase1Domain> = existing
                    .into_iter()
                    .map(|(name, features)| ai::types::Phase1Domain {
                        name,
                        confidence: 1.0,
                        features: features
                            .into_iter()
                            .map(|f| ai::types::Phase1Feature { name: f, test_indices: vec![] })
                            .collect(),
                    })
                    .collect();

                let new_tests: Vec<ai::types::TestNameInput> = uncached_idx
                    .iter()
                    .flat_map(|&gi| groups[gi].test_indices.iter().copied())
                    .map(|ti| ai::types::TestNameInput {
                        index: ti,
                        original_name: tests[ti].original_name.clone(),
                        context: tests[ti].file_path.clone(),
                    })
                    .collect();

                let (output, _usage) = self
                    .ai
                    .place_new_tests(ai::types::PlacementInput {
                        new_tests,
                        existing_domains,
                        language: language.to_string(),
                    })
                    .await
                    .map_err(map_ai_error)?;

                let assigned: HashMap<usize, (String, String)> = output
                    .assignments
                    .into_iter()
                    .filter(|a| a.test_index >= 0)
                    .map(|a| (a.test_index as usize, (a.domain_name, a.feature_name)))
                    .collect();

                for &gi in &uncached_idx {
                    let votes: Vec<(String, String)> = groups[gi]
                        .test_indices
                        .iter()
                        .filter_map(|ti| assigned.get(ti).cloned())
                        .collect();
                    let classification = if votes.is_empty() { fallback_classification() } else { majority_vote(&votes) };
                    self.classification_cache
                        .put(&groups[gi].signature, language, model_id, &classification.domain_name, &classification.feature_name)
                        .await
                        .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;
                    results[gi] = Some(classification);
                }
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap_or_else(fallback_classification)).collect())
    }

    async fn bootstrap_classify(
        &self,
        groups: &[FileGroup],
        tests: &[TestEntry],
        uncached_idx: &[usize],
        language: &str,
        model_id: &str,
        results: &mut [Option<ClassificationResult>],
    ) -> Result<(), PipelineError> {
        for chunk in uncached_idx.chunks(FILES_PER_CLASSIFY_CHUNK) {
            self.classify_chunk(groups, tests, chunk, language, model_id, results).await?;
        }
        Ok(())
    }

    /// Classifies one chunk of files via `classify_domains`, halving the
    /// chunk and retrying on a truncated response (spec.md §4.7) rather than
    /// failing the whole phase over one oversized request. Declared as a
    /// manually-boxed future since it recurses into itself.
    fn classify_chunk<'a>(
        &'a self,
        groups: &'a [FileGroup],
        tests: &'a [TestEntry],
        chunk: &'a [usize],
        language: &'a str,
        model_id: &'a str,
        results: &'a mut [Option<ClassificationResult>],
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut files = Vec::with_capacity(chunk.len());
            let mut owner_of: Vec<usize> = Vec::new();
            for (file_pos, &gi) in chunk.iter().enumerate() {
                let names: Vec<String> = groups[gi].test_indices.iter().map(|&ti| tests[ti].original_name.clone()).collect();
                for _ in &groups[gi].test_indices {
                    owner_of.push(gi);
                }
                files.push(ai::types::FileHint { index: file_pos, path: groups[gi].path.clone(), test_names: names });
            }

            if files.is_empty() {
                return Ok(());
            }

            let input = ai::types::Phase1Input { files, language: language.to_string() };
            let output = match self.ai.classify_domains(input).await {
                Ok((output, _usage)) => output,
                Err(ai::Error::Truncated) if chunk.len() > 1 => {
                    let mid = chunk.len() / 2;
                    self.classify_chunk(groups, tests, &chunk[..mid], language, model_id, results).await?;
                    self.classify_chunk(groups, tests, &chunk[mid..], language, model_id, results).await?;
                    return Ok(());
                }
                Err(e) if chunk.len() > 1 => return Err(map_ai_error(e)),
                Err(_) => return Err(PipelineError::PhaseExhausted { phase: "classification" }),
            };

            let mut votes: HashMap<usize, Vec<(String, String)>> = HashMap::new();
            for domain in &output.domains {
                for feature in &domain.features {
                    for &test_idx in &feature.test_indices {
                        if test_idx < 0 {
                            continue;
                        }
                        let pos = test_idx as usize;
                        if pos >= owner_of.len() {
                            continue;
                        }
                        votes.entry(owner_of[pos]).or_default().push((domain.name.clone(), feature.name.clone()));
                    }
                }
            }

            for &gi in chunk {
                let classification = votes.get(&gi).map(|v| majority_vote(v)).unwrap_or_else(fallback_classification);
                self.classification_cache
                    .put(&groups[gi].signature, language, model_id, &classification.domain_name, &classification.feature_name)
                    .await
                    .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;
                results[gi] = Some(classification);
            }

            Ok(())
        })
    }

    /// Phase 2 inline path (spec.md §4.8 step 4): waves of `convert_test_names`
    /// bounded by a job-local concurrency cap, each wave's results written to
    /// the behavior cache as soon as it completes so a mid-phase failure
    /// leaves finished waves durable.
    async fn convert_waves(
        &self,
        uncached: &[&TestEntry],
        language: &str,
        model_id: &str,
        concurrency: usize,
    ) -> Result<HashMap<usize, String>, PipelineError> {
        let waves: Vec<Vec<(usize, String, String)>> = uncached
            .chunks(TESTS_PER_CONVERT_WAVE)
            .map(|chunk| chunk.iter().map(|t| (t.index, t.original_name.clone(), t.file_path.clone())).collect())
            .collect();

        let language = language.to_string();
        let model_id = model_id.to_string();

        let wave_outcomes: Vec<Result<Vec<(usize, String)>, PipelineError>> = stream::iter(waves.into_iter().map(|wave| {
            let ai = self.ai.clone();
            let behavior_cache = self.behavior_cache.clone();
            let language = language.clone();
            let model_id = model_id.clone();
            async move {
                let input = ai::types::Phase2Input {
                    tests: wave
                        .iter()
                        .map(|(idx, name, path)| ai::types::TestNameInput { index: *idx, original_name: name.clone(), context: path.clone() })
                        .collect(),
                    language: language.clone(),
                };
                let (output, _usage) = ai.convert_test_names(input).await.map_err(map_ai_error)?;

                let mut by_index: HashMap<usize, String> = HashMap::new();
                for behavior in output.behaviors {
                    if behavior.test_index < 0 {
                        continue;
                    }
                    by_index.insert(behavior.test_index as usize, behavior.description);
                }

                let mut writes = Vec::new();
                let mut entries = Vec::new();
                for (idx, name, _path) in &wave {
                    if let Some(desc) = by_index.get(idx) {
                        writes.push((behavior_cache_key(name, &language, &model_id), desc.clone()));
                        entries.push((*idx, desc.clone()));
                    }
                }
                behavior_cache.put_many(&writes).await.map_err(|e| PipelineError::SaveFailed(e.to_string()))?;
                Ok(entries)
            }
        }))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

        let mut result = HashMap::new();
        for outcome in wave_outcomes {
            for (idx, desc) in outcome? {
                result.insert(idx, desc);
            }
        }
        Ok(result)
    }

    /// Phase 2 batch path (spec.md §4.8 step 4, batch variant): submits once,
    /// then on every later invocation polls and either snoozes again or
    /// returns the parsed behaviors.
    async fn run_phase2_batch(
        &self,
        job: &JobRow,
        args: &SpecviewArgs,
        model_id: &str,
        uncached: &[&TestEntry],
        cursor: BatchCursor,
    ) -> Result<BatchStep, PipelineError> {
        let Some(batch_job_name) = cursor.batch_job_name else {
            let input = ai::types::Phase2Input {
                tests: uncached
                    .iter()
                    .map(|t| ai::types::TestNameInput { index: t.index, original_name: t.original_name.clone(), context: t.file_path.clone() })
                    .collect(),
                language: args.language.clone(),
            };
            let batch_job_name = self.ai.submit_batch_job(input).await.map_err(map_ai_error)?;
            let started = Utc::now();
            let metadata = serde_json::to_value(BatchCursor {
                batch_job_name: Some(batch_job_name.clone()),
                batch_started: Some(started),
            })
            .unwrap_or_else(|_| json!({}));
            self.job_store
                .update_metadata(job.id, metadata)
                .await
                .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;
            tracing::info!(job_id = %job.id, batch_job_name = %batch_job_name, "submitted specview phase 2 batch job");
            return Ok(BatchStep::Snoozed(self.batch_poll_interval));
        };

        let started = cursor.batch_started.unwrap_or_else(Utc::now);
        if batch_budget_exceeded(started, Utc::now()) {
            return Err(PipelineError::BatchBudgetExhausted);
        }

        let status = self.ai.get_batch_status(&batch_job_name).await.map_err(map_ai_error)?;
        match status.state {
            Some(ai::types::BatchState::Succeeded) => {
                let responses = status.responses.unwrap_or_default();
                if responses.is_empty() {
                    return Err(PipelineError::AiUnavailable(format!(
                        "batch job {batch_job_name} succeeded with no responses available"
                    )));
                }

                let by_index: HashMap<usize, &TestEntry> = uncached.iter().map(|t| (t.index, *t)).collect();
                let mut behaviors = HashMap::new();
                let mut writes = Vec::new();
                for raw in &responses {
                    let output: ai::types::Phase2Output = match ai::json::parse_tolerant(raw) {
                        Ok(o) => o,
                        Err(e) => {
                            tracing::warn!(batch_job_name = %batch_job_name, error = %e, "dropping unparseable batch response chunk");
                            continue;
                        }
                    };
                    for behavior in output.behaviors {
                        if behavior.test_index < 0 {
                            continue;
                        }
                        let idx = behavior.test_index as usize;
                        if let Some(test) = by_index.get(&idx) {
                            writes.push((behavior_cache_key(&test.original_name, &args.language, model_id), behavior.description.clone()));
                            behaviors.insert(idx, behavior.description);
                        }
                    }
                }
                self.behavior_cache.put_many(&writes).await.map_err(|e| PipelineError::SaveFailed(e.to_string()))?;
                Ok(BatchStep::Done(behaviors))
            }
            Some(ai::types::BatchState::Pending) | Some(ai::types::BatchState::Running) => {
                Ok(BatchStep::Snoozed(self.batch_poll_interval))
            }
            Some(ai::types::BatchState::Failed) => Err(PipelineError::AiUnavailable(format!("batch job {batch_job_name} failed"))),
            Some(ai::types::BatchState::Expired) | Some(ai::types::BatchState::Cancelled) => {
                Err(PipelineError::BatchTerminalFailure(batch_job_name))
            }
            None => Err(PipelineError::AiUnavailable(format!("batch job {batch_job_name} returned no state"))),
        }
    }

    /// Phase 3 and persistence (spec.md §4.8 steps 5-6): builds the
    /// Document -> Domain -> Feature -> Behavior tree with the same
    /// two-pass local-id scheme `storage::models::test_tree` uses, generates
    /// the summary, and writes everything in one transaction.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        args: &SpecviewArgs,
        model_id: &str,
        hash: &str,
        groups: &[FileGroup],
        classifications: &[ClassificationResult],
        tests: &[TestEntry],
        behaviors: &HashMap<usize, String>,
        quota_amount: i32,
    ) -> Result<(), PipelineError> {
        let mut domain_ids: HashMap<String, usize> = HashMap::new();
        let mut domains = Vec::new();
        let mut feature_ids: HashMap<(usize, String), usize> = HashMap::new();
        let mut features = Vec::new();

        for classification in classifications {
            let domain_local = *domain_ids.entry(classification.domain_name.clone()).or_insert_with(|| {
                let id = domains.len();
                domains.push(NewDomain { local_id: id, name: classification.domain_name.clone(), sort_order: id as i32 });
                id
            });
            feature_ids
                .entry((domain_local, classification.feature_name.clone()))
                .or_insert_with(|| {
                    let id = features.len();
                    features.push(NewFeature {
                        local_id: id,
                        domain_local_id: domain_local,
                        name: classification.feature_name.clone(),
                        sort_order: id as i32,
                    });
                    id
                });
        }

        let mut behavior_rows = Vec::with_capacity(tests.len());
        for (group_idx, group) in groups.iter().enumerate() {
            let classification = &classifications[group_idx];
            let domain_local = domain_ids[&classification.domain_name];
            let feature_local = feature_ids[&(domain_local, classification.feature_name.clone())];
            for (sort_order, &test_idx) in group.test_indices.iter().enumerate() {
                let description = behaviors.get(&test_idx).cloned().unwrap_or_else(|| tests[test_idx].original_name.clone());
                behavior_rows.push(NewBehavior {
                    feature_local_id: feature_local,
                    description,
                    source_test_case_id: Some(tests[test_idx].case_id),
                    sort_order: sort_order as i32,
                });
            }
        }

        let domain_names: Vec<String> = domains.iter().map(|d| d.name.clone()).collect();
        let (summary_output, _usage) = self
            .ai
            .generate_summary(ai::types::Phase3Input { domain_names, total_behaviors: tests.len(), language: args.language.clone() })
            .await
            .map_err(map_ai_error)?;

        let document = self
            .spec_documents
            .insert_tree(NewDocumentTree {
                user_id: args.user_id,
                content_hash: hash.to_string(),
                language: args.language.clone(),
                model_id: model_id.to_string(),
                version: DOCUMENT_VERSION,
                summary: summary_output.summary,
                domains,
                features,
                behaviors: behavior_rows,
            })
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;

        if let Err(e) = self.history.insert(args.user_id, document.id).await {
            tracing::warn!(document_id = %document.id, error = %e, "failed to record specview history");
        }
        self.usage_events
            .insert(NewUsageEvent::for_specview(args.user_id, document.id, quota_amount))
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl JobHandler for SpecviewPipeline {
    async fn handle(&self, job: &JobRow, cancel: CancellationToken) -> HandlerOutcome {
        tokio::select! {
            result = self.run(job) => {
                match result {
                    Ok(PipelineCompletion::Done) => HandlerOutcome::Complete,
                    Ok(PipelineCompletion::Snoozed(delay)) => HandlerOutcome::Snooze(delay),
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "specview job failed");
                        e.into_outcome()
                    }
                }
            }
            _ = cancel.cancelled() => {
                HandlerOutcome::Cancel("cancelled by shutdown".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use storage::{
        Analysis, AnalysisStatus, BehaviorCacheEntry, ClassificationCacheEntry, NewAnalysis, NewCase, NewSuite,
        SpecBehavior, SpecDocument, SpecDomain, SpecFeature, TestCase, TestFile, TestSuite, UsageEvent,
        UsageEventRepository, UsageEventType, UserSpecviewHistoryEntry,
    };

    struct FakeAnalyses(Mutex<Vec<Analysis>>);
    #[async_trait]
    impl AnalysisRepository for FakeAnalyses {
        async fn find_completed(&self, _c: Uuid, _s: &str, _p: &str) -> storage::Result<Option<Analysis>> {
            Ok(None)
        }
        async fn insert_pending(&self, _new: NewAnalysis) -> storage::Result<Analysis> {
            unimplemented!("not exercised by specview tests")
        }
        async fn mark_running(&self, _id: Uuid) -> storage::Result<()> {
            Ok(())
        }
        async fn mark_completed(&self, _id: Uuid, _s: i32, _t: i32, _c: Option<chrono::DateTime<Utc>>) -> storage::Result<()> {
            Ok(())
        }
        async fn mark_failed(&self, _id: Uuid, _m: &str) -> storage::Result<()> {
            Ok(())
        }
        async fn get(&self, id: Uuid) -> storage::Result<Option<Analysis>> {
            Ok(self.0.lock().unwrap().iter().find(|a| a.id == id).cloned())
        }
        async fn latest_completed_for_codebase(&self, _c: Uuid) -> storage::Result<Option<Analysis>> {
            Ok(None)
        }
    }

    fn sample_analysis(id: Uuid) -> Analysis {
        Analysis {
            id,
            codebase_id: Uuid::new_v4(),
            commit_sha: "abc123".to_string(),
            branch: "main".to_string(),
            status: AnalysisStatus::Completed.as_db_str().to_string(),
            parser_version: "test-1.0.0".to_string(),
            total_suites: 1,
            total_tests: 2,
            committed_at: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            error_message: None,
        }
    }

    struct FakeTestTree {
        file: TestFile,
        suite: TestSuite,
        cases: Vec<TestCase>,
    }

    fn sample_tree(analysis_id: Uuid) -> FakeTestTree {
        let file_id = Uuid::new_v4();
        let suite_id = Uuid::new_v4();
        FakeTestTree {
            file: TestFile {
                id: file_id,
                analysis_id,
                path: "checkout.test.ts".to_string(),
                framework: "jest".to_string(),
                imports: json!([]),
                calls: json!([]),
            },
            suite: TestSuite {
                id: suite_id,
                analysis_id,
                file_id,
                parent_id: None,
                name: "checkout".to_string(),
                sort_order: 0,
            },
            cases: vec![
                TestCase {
                    id: Uuid::new_v4(),
                    analysis_id,
                    suite_id,
                    name: "applies a valid coupon".to_string(),
                    status: "active".to_string(),
                    modifier: None,
                    sort_order: 0,
                },
                TestCase {
                    id: Uuid::new_v4(),
                    analysis_id,
                    suite_id,
                    name: "rejects an expired coupon".to_string(),
                    status: "active".to_string(),
                    modifier: None,
                    sort_order: 1,
                },
            ],
        }
    }

    #[async_trait]
    impl TestTreeRepository for FakeTestTree {
        async fn persist_inventory(&self, _analysis_id: Uuid, _files: Vec<storage::FileInventory>) -> storage::Result<()> {
            Ok(())
        }
        async fn list_files(&self, _analysis_id: Uuid) -> storage::Result<Vec<TestFile>> {
            Ok(vec![self.file.clone()])
        }
        async fn list_suites(&self, _analysis_id: Uuid) -> storage::Result<Vec<TestSuite>> {
            Ok(vec![self.suite.clone()])
        }
        async fn list_cases(&self, _analysis_id: Uuid) -> storage::Result<Vec<TestCase>> {
            Ok(self.cases.clone())
        }
    }

    #[derive(Default)]
    struct FakeClassificationCache(Mutex<HashMap<String, ClassificationCacheEntry>>);
    #[async_trait]
    impl ClassificationCacheRepository for FakeClassificationCache {
        async fn get(&self, file_signature: &str, _l: &str, _m: &str) -> storage::Result<Option<ClassificationCacheEntry>> {
            Ok(self.0.lock().unwrap().get(file_signature).cloned())
        }
        async fn put(&self, file_signature: &str, language: &str, model_id: &str, domain_name: &str, feature_name: &str) -> storage::Result<()> {
            self.0.lock().unwrap().insert(
                file_signature.to_string(),
                ClassificationCacheEntry {
                    id: Uuid::new_v4(),
                    file_signature: file_signature.to_string(),
                    language: language.to_string(),
                    model_id: model_id.to_string(),
                    domain_name: domain_name.to_string(),
                    feature_name: feature_name.to_string(),
                    created_at: Utc::now(),
                },
            );
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBehaviorCache(Mutex<HashMap<String, String>>);
    #[async_trait]
    impl BehaviorCacheRepository for FakeBehaviorCache {
        async fn get_many(&self, keys: &[String]) -> storage::Result<Vec<BehaviorCacheEntry>> {
            let map = self.0.lock().unwrap();
            Ok(keys
                .iter()
                .filter_map(|k| map.get(k).map(|d| BehaviorCacheEntry { cache_key_hash: k.clone(), description: d.clone(), created_at: Utc::now() }))
                .collect())
        }
        async fn put_many(&self, entries: &[(String, String)]) -> storage::Result<()> {
            let mut map = self.0.lock().unwrap();
            for (k, v) in entries {
                map.insert(k.clone(), v.clone());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSpecDocuments(Mutex<Vec<SpecDocument>>);
    #[async_trait]
    impl SpecDocumentRepository for FakeSpecDocuments {
        async fn find_by_key(&self, user_id: Uuid, content_hash: &str, language: &str, model_id: &str, version: i32) -> storage::Result<Option<SpecDocument>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.user_id == user_id && d.content_hash == content_hash && d.language == language && d.model_id == model_id && d.version == version)
                .cloned())
        }
        async fn insert_tree(&self, tree: NewDocumentTree) -> storage::Result<SpecDocument> {
            let doc = SpecDocument {
                id: Uuid::new_v4(),
                user_id: tree.user_id,
                content_hash: tree.content_hash,
                language: tree.language,
                model_id: tree.model_id,
                version: tree.version,
                summary: tree.summary,
                created_at: Utc::now(),
            };
            self.0.lock().unwrap().push(doc.clone());
            Ok(doc)
        }
        async fn get(&self, id: Uuid) -> storage::Result<Option<SpecDocument>> {
            Ok(self.0.lock().unwrap().iter().find(|d| d.id == id).cloned())
        }
        async fn list_domains(&self, _document_id: Uuid) -> storage::Result<Vec<SpecDomain>> {
            Ok(vec![])
        }
        async fn list_features(&self, _document_id: Uuid) -> storage::Result<Vec<SpecFeature>> {
            Ok(vec![])
        }
        async fn list_behaviors(&self, _document_id: Uuid) -> storage::Result<Vec<SpecBehavior>> {
            Ok(vec![])
        }
    }

    struct FakeHistory(Mutex<usize>);
    #[async_trait]
    impl UserSpecviewHistoryRepository for FakeHistory {
        async fn insert(&self, user_id: Uuid, document_id: Uuid) -> storage::Result<UserSpecviewHistoryEntry> {
            *self.0.lock().unwrap() += 1;
            Ok(UserSpecviewHistoryEntry { id: Uuid::new_v4(), user_id, document_id, created_at: Utc::now() })
        }
        async fn list_for_user(&self, _u: Uuid, _limit: i64) -> storage::Result<Vec<UserSpecviewHistoryEntry>> {
            Ok(vec![])
        }
    }

    struct FakeUsageEvents(Mutex<Vec<UsageEvent>>);
    #[async_trait]
    impl UsageEventRepository for FakeUsageEvents {
        async fn insert(&self, new: NewUsageEvent) -> storage::Result<UsageEvent> {
            let row = UsageEvent {
                id: Uuid::new_v4(),
                user_id: new.user_id,
                event_type: new.event_type.as_db_str().to_string(),
                analysis_id: new.analysis_id,
                document_id: new.document_id,
                quota_amount: new.quota_amount,
                created_at: Utc::now(),
            };
            self.0.lock().unwrap().push(row.clone());
            Ok(row)
        }
        async fn monthly_total(&self, _u: Uuid, _t: UsageEventType, _s: chrono::DateTime<Utc>) -> storage::Result<i64> {
            Ok(0)
        }
    }

    struct FakeAi;
    #[async_trait]
    impl AiAdapter for FakeAi {
        async fn classify_domains(&self, input: ai::types::Phase1Input) -> ai::Result<(ai::types::Phase1Output, ai::types::TokenUsage)> {
            let test_indices: Vec<i64> = input.files.iter().flat_map(|f| 0..f.test_names.len() as i64).collect();
            Ok((
                ai::types::Phase1Output {
                    domains: vec![ai::types::Phase1Domain {
                        name: "Checkout".to_string(),
                        confidence: 0.9,
                        features: vec![ai::types::Phase1Feature { name: "Coupons".to_string(), test_indices }],
                    }],
                },
                ai::types::TokenUsage::default(),
            ))
        }
        async fn convert_test_names(&self, input: ai::types::Phase2Input) -> ai::Result<(ai::types::Phase2Output, ai::types::TokenUsage)> {
            let behaviors = input
                .tests
                .iter()
                .map(|t| ai::types::Phase2Behavior { test_index: t.index as i64, description: format!("it {}", t.original_name), confidence: 0.9 })
                .collect();
            Ok((ai::types::Phase2Output { behaviors }, ai::types::TokenUsage::default()))
        }
        async fn generate_summary(&self, _input: ai::types::Phase3Input) -> ai::Result<(ai::types::Phase3Output, ai::types::TokenUsage)> {
            Ok((ai::types::Phase3Output { summary: "A checkout test suite.".to_string() }, ai::types::TokenUsage::default()))
        }
        async fn place_new_tests(&self, input: ai::types::PlacementInput) -> ai::Result<(ai::types::PlacementOutput, ai::types::TokenUsage)> {
            let assignments = input
                .new_tests
                .iter()
                .map(|t| ai::types::PlacementAssignment { test_index: t.index as i64, domain_name: "Checkout".to_string(), feature_name: "Coupons".to_string() })
                .collect();
            Ok((ai::types::PlacementOutput { assignments }, ai::types::TokenUsage::default()))
        }
        async fn submit_batch_job(&self, _input: ai::types::Phase2Input) -> ai::Result<String> {
            Ok("batch-1".to_string())
        }
        async fn get_batch_status(&self, _job_name: &str) -> ai::Result<ai::types::BatchStatus> {
            Ok(ai::types::BatchStatus::default())
        }
    }

    struct FakeJobStore;
    #[async_trait]
    impl JobStore for FakeJobStore {
        async fn enqueue(&self, _kind: &str, _args: serde_json::Value, _opts: queue::row::EnqueueOptions) -> queue::error::Result<Uuid> {
            unimplemented!()
        }
        async fn claim_ready(&self, _queue: &str, _worker_id: &str, _limit: i64) -> queue::error::Result<Vec<queue::store::ClaimedJob>> {
            Ok(vec![])
        }
        async fn mark_completed(&self, _job_id: Uuid) -> queue::error::Result<()> {
            Ok(())
        }
        async fn mark_retryable(&self, _job_id: Uuid, _error_message: &str, _policy: &dyn queue::backoff::RetryPolicy) -> queue::error::Result<()> {
            Ok(())
        }
        async fn mark_cancelled(&self, _job_id: Uuid, _reason: &str) -> queue::error::Result<()> {
            Ok(())
        }
        async fn snooze(&self, _job_id: Uuid, _duration: Duration) -> queue::error::Result<()> {
            Ok(())
        }
        async fn release_for_shutdown(&self, _job_id: Uuid) -> queue::error::Result<()> {
            Ok(())
        }
        async fn promote_scheduled(&self, _queue: &str) -> queue::error::Result<u64> {
            Ok(0)
        }
        async fn reap_expired_leases(&self, _lease_duration: Duration) -> queue::error::Result<u64> {
            Ok(0)
        }
        async fn purge_finalized(&self, _retention: chrono::Duration) -> queue::error::Result<u64> {
            Ok(0)
        }
        async fn update_metadata(&self, _job_id: Uuid, _metadata: serde_json::Value) -> queue::error::Result<()> {
            Ok(())
        }
        async fn get(&self, _job_id: Uuid) -> queue::error::Result<Option<JobRow>> {
            Ok(None)
        }
        async fn snapshot(&self, queue: &str) -> queue::error::Result<queue::store::QueueSnapshot> {
            Ok(queue::store::QueueSnapshot { queue: queue.to_string(), ..Default::default() })
        }
        async fn acquire_or_renew_leader_lease(&self, _holder_id: &str, _lease_duration: Duration) -> queue::error::Result<bool> {
            Ok(true)
        }
    }

    fn job_with_args(args: serde_json::Value) -> JobRow {
        JobRow {
            id: Uuid::new_v4(),
            kind: "specview:generate".into(),
            queue: "specview_default".into(),
            state: queue::row::JobStateWire(queue::JobState::Running),
            attempt: 1,
            max_attempts: 3,
            priority: 2,
            args,
            metadata: json!({}),
            scheduled_at: Utc::now(),
            created_at: Utc::now(),
            attempted_at: None,
            finalized_at: None,
            unique_key: None,
            errors: vec![],
        }
    }

    #[allow(clippy::type_complexity)]
    fn build_pipeline(
        analysis_id: Uuid,
    ) -> (SpecviewPipeline, Arc<FakeSpecDocuments>, Arc<FakeUsageEvents>) {
        let tree = sample_tree(analysis_id);
        let analyses = Arc::new(FakeAnalyses(Mutex::new(vec![sample_analysis(analysis_id)])));
        let spec_documents = Arc::new(FakeSpecDocuments::default());
        let usage = Arc::new(FakeUsageEvents(Mutex::new(vec![])));
        let pipeline = SpecviewPipeline::new(
            analyses,
            Arc::new(tree),
            Arc::new(FakeClassificationCache::default()),
            Arc::new(FakeBehaviorCache::default()),
            spec_documents.clone(),
            Arc::new(FakeHistory(Mutex::new(0))),
            usage.clone(),
            Arc::new(FakeAi),
            Arc::new(FakeJobStore),
            "claude-test",
            false,
            1000,
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        (pipeline, spec_documents, usage)
    }

    #[tokio::test]
    async fn first_run_produces_one_document_and_one_usage_event() {
        let analysis_id = Uuid::new_v4();
        let (pipeline, documents, usage) = build_pipeline(analysis_id);
        let user_id = Uuid::new_v4();
        let job = job_with_args(json!({"analysis_id": analysis_id, "language": "typescript", "user_id": user_id}));

        let outcome = pipeline.handle(&job, CancellationToken::new()).await;
        assert!(matches!(outcome, HandlerOutcome::Complete));

        let docs = documents.0.lock().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].summary, "A checkout test suite.");

        let events = usage.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].quota_amount, 2);
    }

    #[tokio::test]
    async fn repeated_run_hits_the_document_cache_and_skips_usage_events() {
        let analysis_id = Uuid::new_v4();
        let (pipeline, documents, usage) = build_pipeline(analysis_id);
        let user_id = Uuid::new_v4();
        let job = job_with_args(json!({"analysis_id": analysis_id, "language": "typescript", "user_id": user_id}));

        assert!(matches!(pipeline.handle(&job, CancellationToken::new()).await, HandlerOutcome::Complete));
        assert!(matches!(pipeline.handle(&job, CancellationToken::new()).await, HandlerOutcome::Complete));

        assert_eq!(documents.0.lock().unwrap().len(), 1);
        assert_eq!(usage.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_analysis_is_a_permanent_cancel() {
        let (pipeline, _documents, _usage) = build_pipeline(Uuid::new_v4());
        let job = job_with_args(json!({"analysis_id": Uuid::new_v4(), "language": "typescript", "user_id": Uuid::new_v4()}));

        let outcome = pipeline.handle(&job, CancellationToken::new()).await;
        assert!(matches!(outcome, HandlerOutcome::Cancel(_)));
    }

    #[test]
    fn content_hash_is_order_independent_and_deterministic() {
        let a = content_hash(&["sig-a".to_string(), "sig-b".to_string()], "typescript", "claude-3");
        let b = content_hash(&["sig-b".to_string(), "sig-a".to_string()], "typescript", "claude-3");
        assert_eq!(a, b);

        let c = content_hash(&["sig-a".to_string()], "typescript", "claude-3");
        assert_ne!(a, c);
    }

    #[test]
    fn batch_budget_exhausts_after_24_hours() {
        let started = Utc::now() - chrono::Duration::hours(25);
        assert!(batch_budget_exceeded(started, Utc::now()));
        assert!(!batch_budget_exceeded(Utc::now(), Utc::now()));
    }
}
