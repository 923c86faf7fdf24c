//! Identity Resolver (spec.md §4.4): maps `(host, owner, repo)` plus a
//! hosting-provider external id to a stable [`storage::Codebase`] row across
//! renames, transfers, and delete-recreate cycles.

use std::sync::Arc;

use secrecy::SecretString;
use thiserror::Error;

use storage::{Codebase, CodebaseRepository, NewCodebase};
use vcs::{CanonicalIdentity, HostingProvider, Source};

/// The branch of the resolution algorithm that was taken, logged as a single
/// structured line per spec.md §4.4 ("all logged cases are auditable via the
/// structured log line with a `case` field").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionCase {
    Reanalysis,
    RenameTransfer,
    ForcePush,
    DeleteRecreate,
    New,
}

impl ResolutionCase {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionCase::Reanalysis => "reanalysis",
            ResolutionCase::RenameTransfer => "rename_transfer",
            ResolutionCase::ForcePush => "force_push",
            ResolutionCase::DeleteRecreate => "delete_recreate",
            ResolutionCase::New => "new",
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// spec.md §4.4 step 4: the hosting provider's canonical identity
    /// differs from what the caller asked for — a rename raced the clone.
    /// The caller should retry the whole job; the next attempt will observe
    /// the new path.
    #[error("repository identity changed between clone and resolve (race condition)")]
    RaceCondition,

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Vcs(#[from] vcs::Error),
}

pub struct IdentityResolver {
    codebases: Arc<dyn CodebaseRepository>,
    hosting_provider: Arc<dyn HostingProvider>,
}

impl IdentityResolver {
    pub fn new(codebases: Arc<dyn CodebaseRepository>, hosting_provider: Arc<dyn HostingProvider>) -> Self {
        Self { codebases, hosting_provider }
    }

    /// Runs the full algorithm from spec.md §4.4. `clone` must already exist
    /// (the caller clones before resolving, per the Analyze Pipeline's step
    /// order in §4.6); `is_private` is this attempt's freshly-probed value.
    pub async fn resolve(
        &self,
        host: &str,
        owner: &str,
        name: &str,
        clone: &dyn Source,
        is_private: bool,
        token: Option<&SecretString>,
    ) -> Result<(Codebase, ResolutionCase), ResolveError> {
        // Step 1: look up by path, short-circuit on a still-valid commit.
        let by_path = self.codebases.find_by_path(host, owner, name).await?;

        if let Some(existing) = &by_path {
            if let Some(sha) = &existing.last_commit_sha {
                if !sha.is_empty() && clone.verify_commit_exists(sha).await? {
                    self.codebases
                        .update_privacy_and_commit(existing.id, is_private, sha)
                        .await?;
                    log_case(ResolutionCase::Reanalysis, existing.id, host, owner, name);
                    let refreshed = self.codebases.find_by_path(host, owner, name).await?.unwrap_or_else(|| existing.clone());
                    return Ok((refreshed, ResolutionCase::Reanalysis));
                }
            }
        }

        // Step 3: ask the hosting provider for authoritative identity.
        let canonical = self.hosting_provider.resolve_identity(owner, name, token).await?;

        // Step 4: abort if the provider's canonical path doesn't match the request.
        if !canonical.owner.eq_ignore_ascii_case(owner) || !canonical.name.eq_ignore_ascii_case(name) {
            return Err(ResolveError::RaceCondition);
        }

        // Step 5: resolve by the stable external id.
        let by_external_id = self.codebases.find_by_external_id(host, &canonical.external_repo_id).await?;

        match by_external_id {
            Some(row) if row.is_stale => {
                self.codebases.unmark_stale(row.id).await?;
                self.codebases.update_owner_name(row.id, &canonical.owner, &canonical.name).await?;
                log_case(ResolutionCase::DeleteRecreate, row.id, host, owner, name);
                let refreshed = self.codebases.find_by_external_id(host, &canonical.external_repo_id).await?.unwrap_or(row);
                Ok((refreshed, ResolutionCase::DeleteRecreate))
            }
            Some(row) if !row.owner.eq_ignore_ascii_case(&canonical.owner) || !row.name.eq_ignore_ascii_case(&canonical.name) => {
                self.codebases.update_owner_name(row.id, &canonical.owner, &canonical.name).await?;
                log_case(ResolutionCase::RenameTransfer, row.id, host, owner, name);
                let refreshed = self.codebases.find_by_external_id(host, &canonical.external_repo_id).await?.unwrap_or(row);
                Ok((refreshed, ResolutionCase::RenameTransfer))
            }
            Some(row) => {
                // Same (owner, name): fetch couldn't see the old SHA because
                // history was rewritten (force-push), not because the path moved.
                log_case(ResolutionCase::ForcePush, row.id, host, owner, name);
                Ok((row, ResolutionCase::ForcePush))
            }
            None => {
                if let Some(old) = by_path.filter(|r| r.external_repo_id != canonical.external_repo_id) {
                    self.codebases.mark_stale(old.id).await?;
                    let inserted = self
                        .codebases
                        .insert(NewCodebase {
                            host: host.to_string(),
                            owner: canonical.owner.clone(),
                            name: canonical.name.clone(),
                            external_repo_id: canonical.external_repo_id.clone(),
                            is_private,
                        })
                        .await?;
                    log_case(ResolutionCase::DeleteRecreate, inserted.id, host, owner, name);
                    Ok((inserted, ResolutionCase::DeleteRecreate))
                } else {
                    let inserted = self
                        .codebases
                        .insert(NewCodebase {
                            host: host.to_string(),
                            owner: canonical.owner.clone(),
                            name: canonical.name.clone(),
                            external_repo_id: canonical.external_repo_id.clone(),
                            is_private,
                        })
                        .await?;
                    log_case(ResolutionCase::New, inserted.id, host, owner, name);
                    Ok((inserted, ResolutionCase::New))
                }
            }
        }
    }
}

fn log_case(case: ResolutionCase, codebase_id: uuid::Uuid, host: &str, owner: &str, name: &str) {
    tracing::info!(
        case = case.as_str(),
        codebase_id = %codebase_id,
        host,
        owner,
        name,
        "identity resolved"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use storage::Result as StorageResult;
    use uuid::Uuid;

    struct FakeCodebases {
        rows: Mutex<Vec<Codebase>>,
    }

    impl FakeCodebases {
        fn new(seed: Vec<Codebase>) -> Self {
            Self { rows: Mutex::new(seed) }
        }
    }

    fn row(owner: &str, name: &str, external_id: &str, stale: bool, last_sha: Option<&str>) -> Codebase {
        Codebase {
            id: Uuid::new_v4(),
            host: "github.com".into(),
            owner: owner.into(),
            name: name.into(),
            external_repo_id: external_id.into(),
            default_branch: None,
            is_private: false,
            is_stale: stale,
            last_commit_sha: last_sha.map(String::from),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[async_trait]
    impl CodebaseRepository for FakeCodebases {
        async fn find_by_path(&self, host: &str, owner: &str, name: &str) -> StorageResult<Option<Codebase>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.host == host && r.owner.eq_ignore_ascii_case(owner) && r.name.eq_ignore_ascii_case(name) && !r.is_stale)
                .cloned())
        }

        async fn find_by_external_id(&self, host: &str, external_repo_id: &str) -> StorageResult<Option<Codebase>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.host == host && r.external_repo_id == external_repo_id)
                .cloned())
        }

        async fn insert(&self, new: NewCodebase) -> StorageResult<Codebase> {
            let row = row(&new.owner, &new.name, &new.external_repo_id, false, None);
            self.rows.lock().unwrap().push(row.clone());
            Ok(row)
        }

        async fn mark_stale(&self, id: Uuid) -> StorageResult<()> {
            if let Some(r) = self.rows.lock().unwrap().iter_mut().find(|r| r.id == id) {
                r.is_stale = true;
            }
            Ok(())
        }

        async fn update_owner_name(&self, id: Uuid, owner: &str, name: &str) -> StorageResult<()> {
            if let Some(r) = self.rows.lock().unwrap().iter_mut().find(|r| r.id == id) {
                r.owner = owner.to_string();
                r.name = name.to_string();
            }
            Ok(())
        }

        async fn update_privacy_and_commit(&self, id: Uuid, is_private: bool, last_commit_sha: &str) -> StorageResult<()> {
            if let Some(r) = self.rows.lock().unwrap().iter_mut().find(|r| r.id == id) {
                r.is_private = is_private;
                r.last_commit_sha = Some(last_commit_sha.to_string());
            }
            Ok(())
        }

        async fn unmark_stale(&self, id: Uuid) -> StorageResult<()> {
            if let Some(r) = self.rows.lock().unwrap().iter_mut().find(|r| r.id == id) {
                r.is_stale = false;
            }
            Ok(())
        }
    }

    struct FakeProvider {
        identity: CanonicalIdentity,
    }

    #[async_trait]
    impl HostingProvider for FakeProvider {
        async fn resolve_identity(&self, _owner: &str, _name: &str, _token: Option<&SecretString>) -> vcs::Result<CanonicalIdentity> {
            Ok(self.identity.clone())
        }
    }

    struct FakeSource {
        known_shas: Vec<&'static str>,
    }

    #[async_trait]
    impl Source for FakeSource {
        async fn verify_commit_exists(&self, sha: &str) -> vcs::Result<bool> {
            Ok(self.known_shas.contains(&sha))
        }
        async fn commit_time(&self, _sha: &str) -> vcs::Result<Option<chrono::DateTime<Utc>>> {
            Ok(None)
        }
        fn path(&self) -> &std::path::Path {
            std::path::Path::new("/tmp")
        }
        async fn close(&self) -> vcs::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn reanalysis_short_circuits_without_provider_call() {
        let existing = row("octocat", "hello-world", "42", false, Some("abc123"));
        let codebases = Arc::new(FakeCodebases::new(vec![existing.clone()]));
        // A provider that would answer with a different id, to prove it's never consulted.
        let provider = Arc::new(FakeProvider {
            identity: CanonicalIdentity { external_repo_id: "999".into(), owner: "octocat".into(), name: "hello-world".into() },
        });
        let resolver = IdentityResolver::new(codebases, provider);
        let source = FakeSource { known_shas: vec!["abc123"] };

        let (resolved, case) = resolver
            .resolve("github.com", "octocat", "hello-world", &source, false, None)
            .await
            .unwrap();

        assert_eq!(case, ResolutionCase::Reanalysis);
        assert_eq!(resolved.id, existing.id);
    }

    #[tokio::test]
    async fn rename_transfer_updates_existing_row_by_external_id() {
        let existing = row("old-owner", "my-repo", "42", false, Some("deadbeef"));
        let codebases = Arc::new(FakeCodebases::new(vec![existing.clone()]));
        let provider = Arc::new(FakeProvider {
            identity: CanonicalIdentity { external_repo_id: "42".into(), owner: "new-owner".into(), name: "my-repo".into() },
        });
        let resolver = IdentityResolver::new(codebases, provider);
        // Old SHA not found in the new clone -> falls through to provider lookup.
        let source = FakeSource { known_shas: vec![] };

        let (resolved, case) = resolver
            .resolve("github.com", "new-owner", "my-repo", &source, false, None)
            .await
            .unwrap();

        assert_eq!(case, ResolutionCase::RenameTransfer);
        assert_eq!(resolved.id, existing.id);
        assert_eq!(resolved.owner, "new-owner");
    }

    #[tokio::test]
    async fn force_push_returns_existing_row_unchanged() {
        let existing = row("octocat", "hello-world", "42", false, Some("deadbeef"));
        let codebases = Arc::new(FakeCodebases::new(vec![existing.clone()]));
        let provider = Arc::new(FakeProvider {
            identity: CanonicalIdentity { external_repo_id: "42".into(), owner: "octocat".into(), name: "hello-world".into() },
        });
        let resolver = IdentityResolver::new(codebases, provider);
        let source = FakeSource { known_shas: vec![] };

        let (resolved, case) = resolver
            .resolve("github.com", "octocat", "hello-world", &source, false, None)
            .await
            .unwrap();

        assert_eq!(case, ResolutionCase::ForcePush);
        assert_eq!(resolved.id, existing.id);
    }

    #[tokio::test]
    async fn delete_recreate_marks_old_row_stale_and_inserts_new_one() {
        let existing = row("octocat", "hello-world", "old-id", false, Some("deadbeef"));
        let codebases = Arc::new(FakeCodebases::new(vec![existing.clone()]));
        let provider = Arc::new(FakeProvider {
            identity: CanonicalIdentity { external_repo_id: "new-id".into(), owner: "octocat".into(), name: "hello-world".into() },
        });
        let resolver = IdentityResolver::new(codebases.clone(), provider);
        let source = FakeSource { known_shas: vec![] };

        let (resolved, case) = resolver
            .resolve("github.com", "octocat", "hello-world", &source, false, None)
            .await
            .unwrap();

        assert_eq!(case, ResolutionCase::DeleteRecreate);
        assert_ne!(resolved.id, existing.id);
        assert_eq!(resolved.external_repo_id, "new-id");

        let old = codebases.find_by_external_id("github.com", "old-id").await.unwrap().unwrap();
        assert!(old.is_stale);
    }

    #[tokio::test]
    async fn brand_new_repository_is_inserted() {
        let codebases = Arc::new(FakeCodebases::new(vec![]));
        let provider = Arc::new(FakeProvider {
            identity: CanonicalIdentity { external_repo_id: "1".into(), owner: "octocat".into(), name: "hello-world".into() },
        });
        let resolver = IdentityResolver::new(codebases, provider);
        let source = FakeSource { known_shas: vec![] };

        let (resolved, case) = resolver
            .resolve("github.com", "octocat", "hello-world", &source, false, None)
            .await
            .unwrap();

        assert_eq!(case, ResolutionCase::New);
        assert_eq!(resolved.external_repo_id, "1");
    }

    #[tokio::test]
    async fn canonical_identity_mismatch_is_a_race_condition() {
        let codebases = Arc::new(FakeCodebases::new(vec![]));
        let provider = Arc::new(FakeProvider {
            identity: CanonicalIdentity { external_repo_id: "1".into(), owner: "someone-else".into(), name: "renamed".into() },
        });
        let resolver = IdentityResolver::new(codebases, provider);
        let source = FakeSource { known_shas: vec![] };

        let err = resolver
            .resolve("github.com", "octocat", "hello-world", &source, false, None)
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::RaceCondition));
    }
}
