//! `specvital-worker`: the queue consumer binary. Loads configuration,
//! connects to Postgres, wires the Analyze and SpecView pipelines to the
//! Queue Runtime, and runs worker pools for all six concrete queues
//! (spec.md §6) until a shutdown signal arrives.
//!
//! Mirrors the teacher's `bin/server.rs` bootstrap shape: `tracing_subscriber`
//! registry with an `EnvFilter` + `fmt` layer, `dotenvy`, masked
//! configuration logging, then dependency construction before the long-lived
//! `run()` call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ai::{AiAdapter, ClaudeAdapter};
use queue::{JobHandler, Middleware, QueueConfig, Runtime};
use storage::{
    PgAnalysisRepository, PgBehaviorCacheRepository, PgClassificationCacheRepository, PgCodebaseRepository,
    PgSpecDocumentRepository, PgTestTreeRepository, PgUsageEventRepository, PgUserAnalysisHistoryRepository,
    PgUserSpecviewHistoryRepository,
};
use vcs::{GitAdapter, GitHubProvider};

use worker::analyze::AnalyzePipeline;
use worker::config::Config;
use worker::fairness::FairnessMiddleware;
use worker::identity::IdentityResolver;
use worker::multi_model_ai::MultiModelAdapter;
use worker::oauth::NoTokensStore;
use worker::parser::StubParser;
use worker::specview::SpecviewPipeline;

/// The parser library is an opaque external collaborator (spec.md §1,
/// "Deliberately out of scope"); a real deployment links it and reads its
/// version at startup. This binary ships [`StubParser`] as the swap-in point.
const PARSER_VERSION: &str = "specvital-worker-stub-1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker=debug,queue=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();

    tracing::info!("starting specvital-worker");

    let config = Config::from_env()?;
    config.log_summary();

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections)
        .min_connections(config.db_pool_min_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let job_store = Arc::new(queue::PgJobStore::new(pool.clone()));

    let codebases = Arc::new(PgCodebaseRepository::new(pool.clone()));
    let analyses = Arc::new(PgAnalysisRepository::new(pool.clone()));
    let test_trees = Arc::new(PgTestTreeRepository::new(pool.clone()));
    let usage_events = Arc::new(PgUsageEventRepository::new(pool.clone()));
    let analysis_history = Arc::new(PgUserAnalysisHistoryRepository::new(pool.clone()));
    let specview_history = Arc::new(PgUserSpecviewHistoryRepository::new(pool.clone()));
    let classification_cache = Arc::new(PgClassificationCacheRepository::new(pool.clone()));
    let behavior_cache = Arc::new(PgBehaviorCacheRepository::new(pool.clone()));
    let spec_documents = Arc::new(PgSpecDocumentRepository::new(pool.clone()));

    let vcs: Arc<dyn vcs::VcsAdapter> = Arc::new(GitAdapter::new(config.clone_semaphore_permits));
    let hosting_provider = Arc::new(GitHubProvider::new());
    let identity = Arc::new(IdentityResolver::new(codebases, hosting_provider));

    // Token vault is an external collaborator; no tokens on file means every
    // analyze job degrades to an unauthenticated clone (spec.md §4.6 step 1).
    let oauth: Arc<dyn worker::oauth::OAuthTokenStore> = Arc::new(NoTokensStore);
    let parser: Arc<dyn worker::parser::ParserAdapter> = Arc::new(StubParser::new(PARSER_VERSION));

    let ai_api_key = SecretString::from(config.ai_api_key.clone());
    let ai: Arc<dyn AiAdapter> = Arc::new(MultiModelAdapter::new(
        ClaudeAdapter::new(ai_api_key.clone(), config.ai_model_classification.clone()),
        ClaudeAdapter::new(ai_api_key.clone(), config.ai_model_conversion.clone()),
        ClaudeAdapter::new(ai_api_key, config.ai_model_summary.clone()),
    ));

    let analyze_pipeline = Arc::new(AnalyzePipeline::new(
        oauth,
        vcs,
        identity,
        parser,
        analyses.clone(),
        test_trees.clone(),
        usage_events.clone(),
        analysis_history,
        Duration::from_secs(config.analyze_job_timeout_secs),
    ));

    let specview_pipeline = Arc::new(SpecviewPipeline::new(
        analyses,
        test_trees,
        classification_cache,
        behavior_cache,
        spec_documents,
        specview_history,
        usage_events,
        ai,
        job_store.clone(),
        config.ai_model_conversion.clone(),
        config.specview_use_batch_api,
        config.specview_batch_threshold,
        Duration::from_secs(config.specview_batch_poll_interval_secs),
        Duration::from_secs(config.specview_job_timeout_secs),
    ));

    let fairness: Arc<dyn Middleware> = Arc::new(FairnessMiddleware::new(config.fairness_free_tier_cap));

    let mut runtime = Runtime::new(job_store).with_middleware(fairness);

    register_queues(&mut runtime, "analysis:analyze", "analysis", analyze_pipeline, config.analyze_workers);
    register_queues(&mut runtime, "specview:generate", "specview", specview_pipeline, config.specview_workers);

    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, draining in-flight jobs");
            shutdown.shutdown(Duration::from_secs(30)).await;
        }
    });

    runtime.run().await;

    tracing::info!("specvital-worker stopped cleanly");
    Ok(())
}

/// Registers one handler under the three concrete queues a job kind serves
/// (`<base>_priority`, `<base>_default`, `<base>_scheduled`; spec.md §6). The
/// runtime keys its internal registration map by the string passed as
/// `kind`, so each queue gets a distinct key built from the job kind and
/// queue name; the handler itself is indifferent to which queue delivered
/// the job.
fn register_queues(
    runtime: &mut Runtime,
    kind: &str,
    base_queue: &str,
    handler: Arc<dyn JobHandler>,
    counts: worker::config::QueueWorkerCounts,
) {
    let queues = [
        (format!("{base_queue}_priority"), counts.priority),
        (format!("{base_queue}_default"), counts.default),
        (format!("{base_queue}_scheduled"), counts.scheduled),
    ];
    for (queue_name, workers) in queues {
        if workers == 0 {
            continue;
        }
        runtime.register_worker(
            format!("{kind}#{queue_name}"),
            handler.clone(),
            QueueConfig::new(queue_name, workers),
        );
    }
}
