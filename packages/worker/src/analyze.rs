//! Analyze Pipeline (spec.md §4.6): handler for the `analysis:analyze` job
//! kind. Orchestrates the OAuth lookup, VCS probe/clone, Identity Resolver,
//! Parser Adapter, and Storage into one job, per the eight numbered steps in
//! spec.md §4.6.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use queue::{HandlerOutcome, JobHandler, JobRow};
use storage::{
    AnalysisRepository, FileInventory, NewAnalysis, NewUsageEvent, TestTreeRepository,
    UserAnalysisHistoryRepository,
};
use vcs::VcsAdapter;

use crate::error::PipelineError;
use crate::identity::{IdentityResolver, ResolveError};
use crate::oauth::OAuthTokenStore;
use crate::parser::{ParsedFile, ParserAdapter};

/// Job args for `analysis:analyze` (spec.md §4.6: "Job args:
/// `{analysis_id?, owner, repo, user_id?}`. Unique key derives from
/// `(owner, repo, user_id)`.").
///
/// `host` is not named in the distilled spec's arg list but is required to
/// address a repository at all; it defaults to `github.com`, the only
/// hosting provider this worker implements (spec.md §4.4 names `host` as
/// part of the `Codebase` key, so it must travel with the job somehow).
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeArgs {
    #[serde(default)]
    pub analysis_id: Option<Uuid>,
    #[serde(default = "default_host")]
    pub host: String,
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub tier: Option<String>,
}

fn default_host() -> String {
    "github.com".to_string()
}

impl AnalyzeArgs {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.owner.trim().is_empty() || self.repo.trim().is_empty() {
            return Err(PipelineError::InvalidInput("owner and repo are required".into()));
        }
        Ok(())
    }

    fn clone_url(&self) -> String {
        format!("https://{}/{}/{}.git", self.host, self.owner, self.repo)
    }
}

pub struct AnalyzePipeline {
    oauth: Arc<dyn OAuthTokenStore>,
    vcs: Arc<dyn VcsAdapter>,
    identity: Arc<IdentityResolver>,
    parser: Arc<dyn ParserAdapter>,
    analyses: Arc<dyn AnalysisRepository>,
    test_trees: Arc<dyn TestTreeRepository>,
    usage_events: Arc<dyn storage::UsageEventRepository>,
    history: Arc<dyn UserAnalysisHistoryRepository>,
    job_timeout: Duration,
}

impl AnalyzePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        oauth: Arc<dyn OAuthTokenStore>,
        vcs: Arc<dyn VcsAdapter>,
        identity: Arc<IdentityResolver>,
        parser: Arc<dyn ParserAdapter>,
        analyses: Arc<dyn AnalysisRepository>,
        test_trees: Arc<dyn TestTreeRepository>,
        usage_events: Arc<dyn storage::UsageEventRepository>,
        history: Arc<dyn UserAnalysisHistoryRepository>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            oauth,
            vcs,
            identity,
            parser,
            analyses,
            test_trees,
            usage_events,
            history,
            job_timeout,
        }
    }

    async fn run(&self, job: &JobRow) -> Result<(), PipelineError> {
        let args: AnalyzeArgs =
            serde_json::from_value(job.args.clone()).map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
        args.validate()?;

        tokio::time::timeout(self.job_timeout, self.run_inner(args))
            .await
            .map_err(|_| PipelineError::Other(anyhow::anyhow!("analyze job exceeded its timeout budget")))?
    }

    async fn run_inner(&self, args: AnalyzeArgs) -> Result<(), PipelineError> {
        // Step 1: OAuth token lookup. "Token not found" degrades to
        // unauthenticated; an infrastructure error is retryable.
        let token: Option<SecretString> = match args.user_id {
            Some(user_id) => self
                .oauth
                .get_token(user_id)
                .await
                .map_err(PipelineError::Other)?,
            None => None,
        };

        // Step 2: probe HEAD.
        let url = args.clone_url();
        let head = self
            .vcs
            .get_head_commit(&url, token.as_ref())
            .await
            .map_err(|e| PipelineError::CloneFailed(e.to_string()))?;

        // Step 3: acquire the clone semaphore (internal to the VCS adapter)
        // and clone.
        let source = self
            .vcs
            .clone(&url, token.as_ref())
            .await
            .map_err(|e| PipelineError::CloneFailed(e.to_string()))?;

        let outcome = self
            .analyze_cloned(&args, token.as_ref(), head, source.as_ref())
            .await;

        if let Err(e) = source.close().await {
            tracing::warn!(owner = %args.owner, repo = %args.repo, error = %e, "failed to close cloned source");
        }

        outcome
    }

    async fn analyze_cloned(
        &self,
        args: &AnalyzeArgs,
        token: Option<&SecretString>,
        head: vcs::HeadCommit,
        source: &dyn vcs::Source,
    ) -> Result<(), PipelineError> {
        // Step 4: resolve identity.
        let (codebase, case) = self
            .identity
            .resolve(&args.host, &args.owner, &args.repo, source, head.is_private, token)
            .await
            .map_err(|e| match e {
                ResolveError::RaceCondition => PipelineError::RaceCondition,
                ResolveError::Storage(e) => PipelineError::SaveFailed(e.to_string()),
                ResolveError::Vcs(e) => PipelineError::CloneFailed(e.to_string()),
            })?;
        tracing::debug!(case = case.as_str(), codebase_id = %codebase.id, "identity resolved for analyze job");

        // L2/I3 (spec.md:334, :50): a completed analysis already exists for
        // this (codebase, commit, parser_version) — short-circuit instead of
        // inserting a second pending row, which would collide with the
        // partial unique index on mark_completed.
        if let Some(existing) = self
            .analyses
            .find_completed(codebase.id, &head.sha, self.parser.version())
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?
        {
            tracing::info!(analysis_id = %existing.id, codebase_id = %codebase.id, "analysis already completed for this commit, skipping reanalysis");
            return Ok(());
        }

        // Step 5: insert a pending Analysis row. `parser_version` is captured
        // at worker startup from the linked parser library (SPEC_FULL.md §11).
        let branch = codebase.default_branch.clone().unwrap_or_else(|| "main".to_string());
        let analysis = self
            .analyses
            .insert_pending(NewAnalysis {
                codebase_id: codebase.id,
                commit_sha: head.sha.clone(),
                branch,
                parser_version: self.parser.version().to_string(),
            })
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;

        if let Err(e) = self.analyses.mark_running(analysis.id).await {
            tracing::warn!(analysis_id = %analysis.id, error = %e, "failed to mark analysis running");
        }

        match self.parse_and_persist(source, analysis.id).await {
            Ok((total_suites, total_tests)) => {
                // committed_at "from the commit metadata" (spec.md §4.6 step 7):
                // best-effort — a lookup failure here must not fail an
                // otherwise-successful analysis.
                let committed_at = source.commit_time(&head.sha).await.unwrap_or(None);
                self.analyses
                    .mark_completed(analysis.id, total_suites, total_tests, committed_at)
                    .await
                    .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;

                if let Some(user_id) = args.user_id {
                    if let Err(e) = self.history.insert(user_id, analysis.id).await {
                        tracing::warn!(analysis_id = %analysis.id, error = %e, "failed to record analysis history");
                    }
                    self.usage_events
                        .insert(NewUsageEvent::for_analysis(user_id, analysis.id, 1))
                        .await
                        .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;
                }

                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(mark_err) = self.analyses.mark_failed(analysis.id, &message).await {
                    tracing::error!(analysis_id = %analysis.id, error = %mark_err, "failed to record analysis failure");
                }
                Err(e)
            }
        }
    }

    async fn parse_and_persist(&self, source: &dyn vcs::Source, analysis_id: Uuid) -> Result<(i32, i32), PipelineError> {
        // Step 6: parse.
        let inventory = self
            .parser
            .scan(source.path())
            .await
            .map_err(|e| PipelineError::ScanFailed(e.to_string()))?;

        let total_suites = inventory.total_suites();
        let total_tests = inventory.total_tests();

        // Step 7: persist transactionally, respecting the two-pass
        // suite-tree insert the storage layer already implements.
        let files: Vec<FileInventory> = inventory.files.into_iter().map(into_file_inventory).collect();
        self.test_trees
            .persist_inventory(analysis_id, files)
            .await
            .map_err(|e| PipelineError::SaveFailed(e.to_string()))?;

        Ok((total_suites, total_tests))
    }
}

fn into_file_inventory(file: ParsedFile) -> FileInventory {
    FileInventory {
        path: file.path,
        framework: file.framework,
        imports: json!(file.imports),
        calls: json!(file.calls),
        suites: file.suites,
        cases: file.cases,
    }
}

#[async_trait]
impl JobHandler for AnalyzePipeline {
    async fn handle(&self, job: &JobRow, cancel: CancellationToken) -> HandlerOutcome {
        tokio::select! {
            result = self.run(job) => {
                match result {
                    Ok(()) => HandlerOutcome::Complete,
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "analyze job failed");
                        e.into_outcome()
                    }
                }
            }
            _ = cancel.cancelled() => {
                // Handled by the worker pool's shutdown path (release_for_shutdown),
                // not by this handler's own outcome — see spec.md §5, B4.
                HandlerOutcome::Cancel("cancelled by shutdown".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use storage::{Analysis, AnalysisStatus, Codebase, CodebaseRepository, NewCodebase, UsageEvent, UsageEventRepository, UsageEventType};
    use vcs::{CanonicalIdentity, HeadCommit, HostingProvider, Source};

    struct FakeOAuth;
    #[async_trait]
    impl OAuthTokenStore for FakeOAuth {
        async fn get_token(&self, _user_id: Uuid) -> anyhow::Result<Option<SecretString>> {
            Ok(None)
        }
    }

    struct FakeVcs {
        sha: String,
    }
    struct FakeSource;
    #[async_trait]
    impl Source for FakeSource {
        async fn verify_commit_exists(&self, _sha: &str) -> vcs::Result<bool> {
            Ok(false)
        }
        async fn commit_time(&self, _sha: &str) -> vcs::Result<Option<chrono::DateTime<Utc>>> {
            Ok(None)
        }
        fn path(&self) -> &Path {
            Path::new("/tmp")
        }
        async fn close(&self) -> vcs::Result<()> {
            Ok(())
        }
    }
    #[async_trait]
    impl VcsAdapter for FakeVcs {
        async fn get_head_commit(&self, _url: &str, _token: Option<&SecretString>) -> vcs::Result<HeadCommit> {
            Ok(HeadCommit { sha: self.sha.clone(), is_private: false })
        }
        async fn clone(&self, _url: &str, _token: Option<&SecretString>) -> vcs::Result<Box<dyn Source>> {
            Ok(Box::new(FakeSource))
        }
    }

    struct FakeProvider;
    #[async_trait]
    impl HostingProvider for FakeProvider {
        async fn resolve_identity(&self, owner: &str, name: &str, _token: Option<&SecretString>) -> vcs::Result<CanonicalIdentity> {
            Ok(CanonicalIdentity {
                external_repo_id: "1".to_string(),
                owner: owner.to_string(),
                name: name.to_string(),
            })
        }
    }

    struct FakeCodebases(Mutex<Vec<Codebase>>);
    #[async_trait]
    impl CodebaseRepository for FakeCodebases {
        async fn find_by_path(&self, _h: &str, _o: &str, _n: &str) -> storage::Result<Option<Codebase>> {
            Ok(None)
        }
        async fn find_by_external_id(&self, _h: &str, _id: &str) -> storage::Result<Option<Codebase>> {
            Ok(None)
        }
        async fn insert(&self, new: NewCodebase) -> storage::Result<Codebase> {
            let row = Codebase {
                id: Uuid::new_v4(),
                host: new.host,
                owner: new.owner,
                name: new.name,
                external_repo_id: new.external_repo_id,
                default_branch: None,
                is_private: new.is_private,
                is_stale: false,
                last_commit_sha: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            self.0.lock().unwrap().push(row.clone());
            Ok(row)
        }
        async fn mark_stale(&self, _id: Uuid) -> storage::Result<()> {
            Ok(())
        }
        async fn update_owner_name(&self, _id: Uuid, _o: &str, _n: &str) -> storage::Result<()> {
            Ok(())
        }
        async fn update_privacy_and_commit(&self, _id: Uuid, _p: bool, _s: &str) -> storage::Result<()> {
            Ok(())
        }
        async fn unmark_stale(&self, _id: Uuid) -> storage::Result<()> {
            Ok(())
        }
    }

    struct FakeAnalyses(Mutex<Vec<Analysis>>);
    #[async_trait]
    impl AnalysisRepository for FakeAnalyses {
        async fn find_completed(&self, _c: Uuid, _s: &str, _p: &str) -> storage::Result<Option<Analysis>> {
            Ok(None)
        }
        async fn insert_pending(&self, new: NewAnalysis) -> storage::Result<Analysis> {
            let row = Analysis {
                id: Uuid::new_v4(),
                codebase_id: new.codebase_id,
                commit_sha: new.commit_sha,
                branch: new.branch,
                status: AnalysisStatus::Pending.as_db_str().to_string(),
                parser_version: new.parser_version,
                total_suites: 0,
                total_tests: 0,
                committed_at: None,
                started_at: Utc::now(),
                completed_at: None,
                error_message: None,
            };
            self.0.lock().unwrap().push(row.clone());
            Ok(row)
        }
        async fn mark_running(&self, _id: Uuid) -> storage::Result<()> {
            Ok(())
        }
        async fn mark_completed(&self, id: Uuid, total_suites: i32, total_tests: i32, _committed_at: Option<chrono::DateTime<Utc>>) -> storage::Result<()> {
            let mut rows = self.0.lock().unwrap();
            if let Some(r) = rows.iter_mut().find(|r| r.id == id) {
                r.status = AnalysisStatus::Completed.as_db_str().to_string();
                r.total_suites = total_suites;
                r.total_tests = total_tests;
            }
            Ok(())
        }
        async fn mark_failed(&self, id: Uuid, error_message: &str) -> storage::Result<()> {
            let mut rows = self.0.lock().unwrap();
            if let Some(r) = rows.iter_mut().find(|r| r.id == id) {
                r.status = AnalysisStatus::Failed.as_db_str().to_string();
                r.error_message = Some(error_message.to_string());
            }
            Ok(())
        }
        async fn get(&self, id: Uuid) -> storage::Result<Option<Analysis>> {
            Ok(self.0.lock().unwrap().iter().find(|r| r.id == id).cloned())
        }
        async fn latest_completed_for_codebase(&self, _c: Uuid) -> storage::Result<Option<Analysis>> {
            Ok(None)
        }
    }

    struct FakeTestTree;
    #[async_trait]
    impl TestTreeRepository for FakeTestTree {
        async fn persist_inventory(&self, _analysis_id: Uuid, _files: Vec<FileInventory>) -> storage::Result<()> {
            Ok(())
        }
        async fn list_files(&self, _analysis_id: Uuid) -> storage::Result<Vec<storage::TestFile>> {
            Ok(vec![])
        }
        async fn list_suites(&self, _analysis_id: Uuid) -> storage::Result<Vec<storage::TestSuite>> {
            Ok(vec![])
        }
        async fn list_cases(&self, _analysis_id: Uuid) -> storage::Result<Vec<storage::TestCase>> {
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

    struct FakeHistory(Mutex<usize>);
    #[async_trait]
    impl UserAnalysisHistoryRepository for FakeHistory {
        async fn insert(&self, user_id: Uuid, analysis_id: Uuid) -> storage::Result<storage::UserAnalysisHistoryEntry> {
            *self.0.lock().unwrap() += 1;
            Ok(storage::UserAnalysisHistoryEntry { id: Uuid::new_v4(), user_id, analysis_id, created_at: Utc::now() })
        }
        async fn list_for_user(&self, _u: Uuid, _limit: i64) -> storage::Result<Vec<storage::UserAnalysisHistoryEntry>> {
            Ok(vec![])
        }
    }

    fn build_pipeline() -> (AnalyzePipeline, Arc<FakeAnalyses>, Arc<FakeUsageEvents>) {
        let codebases = Arc::new(FakeCodebases(Mutex::new(vec![])));
        let analyses = Arc::new(FakeAnalyses(Mutex::new(vec![])));
        let usage = Arc::new(FakeUsageEvents(Mutex::new(vec![])));
        let pipeline = AnalyzePipeline::new(
            Arc::new(FakeOAuth),
            Arc::new(FakeVcs { sha: "abc123".to_string() }),
            Arc::new(IdentityResolver::new(codebases, Arc::new(FakeProvider))),
            Arc::new(crate::parser::StubParser::new("test-1.0.0")),
            analyses.clone(),
            Arc::new(FakeTestTree),
            usage.clone(),
            Arc::new(FakeHistory(Mutex::new(0))),
            Duration::from_secs(5),
        );
        (pipeline, analyses, usage)
    }

    fn job_with_args(args: serde_json::Value) -> JobRow {
        JobRow {
            id: Uuid::new_v4(),
            kind: "analysis:analyze".into(),
            queue: "analysis_default".into(),
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

    #[tokio::test]
    async fn new_public_repository_completes_with_one_usage_event() {
        let (pipeline, analyses, usage) = build_pipeline();
        let user_id = Uuid::new_v4();
        let job = job_with_args(json!({"owner": "octocat", "repo": "hello-world", "user_id": user_id}));

        let outcome = pipeline.handle(&job, CancellationToken::new()).await;
        assert!(matches!(outcome, HandlerOutcome::Complete));

        let rows = analyses.0.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[0].total_tests, 1);

        let events = usage.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].quota_amount, 1);
    }

    #[tokio::test]
    async fn anonymous_analysis_completes_without_a_usage_event() {
        let (pipeline, analyses, usage) = build_pipeline();
        let job = job_with_args(json!({"owner": "octocat", "repo": "hello-world"}));

        let outcome = pipeline.handle(&job, CancellationToken::new()).await;
        assert!(matches!(outcome, HandlerOutcome::Complete));
        assert_eq!(analyses.0.lock().unwrap().len(), 1);
        assert_eq!(usage.0.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn missing_owner_is_a_permanent_cancel() {
        let (pipeline, _analyses, _usage) = build_pipeline();
        let job = job_with_args(json!({"owner": "", "repo": "hello-world"}));

        let outcome = pipeline.handle(&job, CancellationToken::new()).await;
        assert!(matches!(outcome, HandlerOutcome::Cancel(_)));
    }
}
