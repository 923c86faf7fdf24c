//! Hosting-provider-agnostic repository access (spec.md §4.5).

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct HeadCommit {
    pub sha: String,
    pub is_private: bool,
}

/// A cloned working tree, owned by the caller until `close()` (or drop).
#[async_trait]
pub trait Source: Send + Sync {
    /// Consults the cloned tree's object database directly, avoiding an
    /// external round-trip (used by the identity resolver, spec.md §4.4 step 2).
    async fn verify_commit_exists(&self, sha: &str) -> Result<bool>;

    /// The commit's authored timestamp, read from the object database. Used
    /// by the Analyze Pipeline to populate `Analysis.committed_at` "from the
    /// commit metadata" (spec.md §4.6 step 7). `None` if the commit can't be
    /// found or its timestamp can't be represented.
    async fn commit_time(&self, sha: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>>;

    fn path(&self) -> &std::path::Path;

    /// Removes the working directory. Idempotent: a second call is a no-op.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait VcsAdapter: Send + Sync {
    /// Probes `ls-remote` without credentials first (public ⇒ `is_private=false`);
    /// on auth failure retries with `token` (success ⇒ `is_private=true`). This
    /// is the sole visibility-inference mechanism; no provider-specific API call
    /// is made for the public/private distinction.
    async fn get_head_commit(&self, url: &str, token: Option<&SecretString>) -> Result<HeadCommit>;

    /// Shallow clone (`depth=1`, single-branch). Globally rate-limited by a
    /// counting semaphore to bound aggregate disk/bandwidth/CPU even under
    /// job concurrency; acquisition respects cancellation.
    async fn clone(&self, url: &str, token: Option<&SecretString>) -> Result<Box<dyn Source>>;
}
