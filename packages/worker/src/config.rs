//! Environment-variable configuration, loaded once at startup (SPEC_FULL.md
//! §10.3). Follows the teacher's `server_core::config::Config` shape: a flat
//! struct built by `Config::from_env()`, `dotenvy::dotenv().ok()` called
//! first, required values via `anyhow::Context`, optional values with
//! documented defaults.

use std::env;

use anyhow::{Context, Result};

/// Per-queue worker pool sizes for one job kind's three concrete queues
/// (`<base>_priority`, `<base>_default`, `<base>_scheduled`; spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct QueueWorkerCounts {
    pub priority: usize,
    pub default: usize,
    pub scheduled: usize,
}

impl QueueWorkerCounts {
    fn from_env(prefix: &str, default_priority: usize, default_default: usize, default_scheduled: usize) -> Self {
        Self {
            priority: env_usize(&format!("{prefix}_QUEUE_PRIORITY_WORKERS"), default_priority),
            default: env_usize(&format!("{prefix}_QUEUE_DEFAULT_WORKERS"), default_default),
            scheduled: env_usize(&format!("{prefix}_QUEUE_SCHEDULED_WORKERS"), default_scheduled),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub analyze_workers: QueueWorkerCounts,
    pub specview_workers: QueueWorkerCounts,

    /// spec.md §4.5: "bounded by a global semaphore (default small integer, e.g., 2)".
    pub clone_semaphore_permits: usize,
    /// spec.md §4.2: "bounded by a configured cap (default small integer)".
    pub fairness_free_tier_cap: i64,

    /// spec.md §4.6: "Timeout budget: 5 minutes (or an environment-configured value) per attempt."
    pub analyze_job_timeout_secs: u64,
    /// spec.md §4.8: "Timeout budget: 35 minutes per attempt."
    pub specview_job_timeout_secs: u64,

    pub specview_use_batch_api: bool,
    pub specview_batch_threshold: usize,
    pub specview_batch_poll_interval_secs: u64,

    pub ai_api_key: String,
    pub ai_model_classification: String,
    pub ai_model_conversion: String,
    pub ai_model_summary: String,

    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,

            analyze_workers: QueueWorkerCounts::from_env("ANALYZE", 2, 4, 1),
            specview_workers: QueueWorkerCounts::from_env("SPECVIEW", 2, 4, 1),

            clone_semaphore_permits: env_usize("CLONE_SEMAPHORE_PERMITS", 2),
            fairness_free_tier_cap: env_i64("FAIRNESS_FREE_TIER_CAP", 2),

            analyze_job_timeout_secs: env_u64("ANALYZE_JOB_TIMEOUT_SECS", 300),
            specview_job_timeout_secs: env_u64("SPECVIEW_JOB_TIMEOUT_SECS", 2100),

            specview_use_batch_api: env_bool("SPECVIEW_USE_BATCH_API", false),
            specview_batch_threshold: env_usize("SPECVIEW_BATCH_THRESHOLD", 5_000),
            specview_batch_poll_interval_secs: env_u64("SPECVIEW_BATCH_POLL_INTERVAL_SECS", 60),

            ai_api_key: env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY must be set")?,
            ai_model_classification: env::var("AI_MODEL_CLASSIFICATION")
                .unwrap_or_else(|_| "claude-3-5-haiku-20241022".to_string()),
            ai_model_conversion: env::var("AI_MODEL_CONVERSION")
                .unwrap_or_else(|_| "claude-3-5-haiku-20241022".to_string()),
            ai_model_summary: env::var("AI_MODEL_SUMMARY")
                .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string()),

            db_pool_max_connections: env_usize("DB_POOL_MAX_CONNECTIONS", 10) as u32,
            db_pool_min_connections: env_usize("DB_POOL_MIN_CONNECTIONS", 2) as u32,
        })
    }

    /// Masked debug-logging of sensitive values at startup, matching the
    /// teacher's `bin/server.rs` `mask_env` helper.
    pub fn log_summary(&self) {
        fn mask(value: &str) -> String {
            let show = value.len().min(4);
            format!("{}{}  ({} chars)", &value[..show], "*".repeat(value.len().saturating_sub(show)), value.len())
        }
        tracing::info!("configuration:");
        tracing::info!("  DATABASE_URL: {}", mask(&self.database_url));
        tracing::info!("  ANTHROPIC_API_KEY: {}", mask(&self.ai_api_key));
        tracing::info!(
            "  analyze workers: priority={} default={} scheduled={}",
            self.analyze_workers.priority,
            self.analyze_workers.default,
            self.analyze_workers.scheduled
        );
        tracing::info!(
            "  specview workers: priority={} default={} scheduled={}",
            self.specview_workers.priority,
            self.specview_workers.default,
            self.specview_workers.scheduled
        );
        tracing::info!("  clone semaphore permits: {}", self.clone_semaphore_permits);
        tracing::info!("  fairness free-tier cap: {}", self.fairness_free_tier_cap);
        tracing::info!("  specview batch API: enabled={} threshold={}", self.specview_use_batch_api, self.specview_batch_threshold);
    }
}
