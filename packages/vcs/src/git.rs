use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::{Cred, FetchOptions, RemoteCallbacks};
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::adapter::{HeadCommit, Source, VcsAdapter};
use crate::error::{redact_credentials, Error, Result};

/// Shallow-clones and probes git repositories over HTTPS.
///
/// Clone concurrency is bounded globally by `clone_semaphore` (spec.md §4.5):
/// a small counting semaphore shared across every job in the process, so
/// worker-pool fan-out cannot exhaust disk, bandwidth, or CPU.
pub struct GitAdapter {
    clone_semaphore: Arc<Semaphore>,
}

impl GitAdapter {
    pub fn new(max_concurrent_clones: usize) -> Self {
        Self {
            clone_semaphore: Arc::new(Semaphore::new(max_concurrent_clones.max(1))),
        }
    }

    fn credentials_callback(token: Option<SecretString>) -> RemoteCallbacks<'static> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed| {
            if let Some(token) = &token {
                if allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT) {
                    return Cred::userpass_plaintext(
                        username_from_url.unwrap_or("x-access-token"),
                        token.expose_secret(),
                    );
                }
            }
            Cred::default()
        });
        callbacks
    }

    fn probe_head_blocking(url: String, token: Option<SecretString>) -> Result<HeadCommit> {
        let attempt = |token: Option<SecretString>| -> std::result::Result<String, git2::Error> {
            let callbacks = Self::credentials_callback(token);
            let mut remote = git2::Remote::create_detached(&url)?;
            remote.connect_auth(git2::Direction::Fetch, Some(callbacks), None)?;
            let head = remote
                .list()?
                .iter()
                .find(|h| h.name() == "HEAD")
                .map(|h| h.oid().to_string())
                .ok_or_else(|| git2::Error::from_str("remote has no HEAD"))?;
            remote.disconnect()?;
            Ok(head)
        };

        match attempt(None) {
            Ok(sha) => Ok(HeadCommit { sha, is_private: false }),
            Err(e) if is_auth_error(&e) && token.is_some() => match attempt(token) {
                Ok(sha) => Ok(HeadCommit { sha, is_private: true }),
                Err(e) => {
                    tracing::warn!(error = %redact_credentials(&e.to_string()), "authenticated ls-remote failed");
                    Err(Error::AuthFailed)
                }
            },
            Err(e) if is_auth_error(&e) => Err(Error::AuthFailed),
            Err(e) => Err(Error::CloneFailed(redact_credentials(&e.to_string()))),
        }
    }

    fn clone_blocking(url: String, token: Option<SecretString>) -> Result<GitSource> {
        let dir = TempDir::new().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        let callbacks = Self::credentials_callback(token);

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(callbacks);
        fetch_options.depth(1);

        let repo = git2::build::RepoBuilder::new()
            .fetch_options(fetch_options)
            .clone(&url, dir.path())
            .map_err(|e| Error::CloneFailed(redact_credentials(&e.to_string())))?;

        let path = dir.path().to_path_buf();
        Ok(GitSource {
            _dir: dir,
            path,
            repo: std::sync::Mutex::new(Some(repo)),
        })
    }
}

fn is_auth_error(e: &git2::Error) -> bool {
    matches!(
        e.code(),
        git2::ErrorCode::Auth | git2::ErrorCode::Certificate
    ) || e.class() == git2::ErrorClass::Http
}

#[async_trait]
impl VcsAdapter for GitAdapter {
    async fn get_head_commit(&self, url: &str, token: Option<&SecretString>) -> Result<HeadCommit> {
        let url = url.to_string();
        let token = token.cloned();
        tokio::task::spawn_blocking(move || Self::probe_head_blocking(url, token))
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?
    }

    async fn clone(&self, url: &str, token: Option<&SecretString>) -> Result<Box<dyn Source>> {
        let permit = self
            .clone_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;

        let url = url.to_string();
        let token = token.cloned();
        let source = tokio::task::spawn_blocking(move || Self::clone_blocking(url, token))
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))??;

        drop(permit);
        Ok(Box::new(source))
    }
}

pub struct GitSource {
    _dir: TempDir,
    path: PathBuf,
    repo: std::sync::Mutex<Option<git2::Repository>>,
}

#[async_trait]
impl Source for GitSource {
    async fn verify_commit_exists(&self, sha: &str) -> Result<bool> {
        let oid = match git2::Oid::from_str(sha) {
            Ok(oid) => oid,
            Err(_) => return Ok(false),
        };
        let guard = self.repo.lock().map_err(|_| Error::ObjectDb("poisoned lock".into()))?;
        match guard.as_ref() {
            Some(repo) => Ok(repo.find_commit(oid).is_ok()),
            None => Ok(false),
        }
    }

    async fn commit_time(&self, sha: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let oid = match git2::Oid::from_str(sha) {
            Ok(oid) => oid,
            Err(_) => return Ok(None),
        };
        let guard = self.repo.lock().map_err(|_| Error::ObjectDb("poisoned lock".into()))?;
        let repo = match guard.as_ref() {
            Some(repo) => repo,
            None => return Ok(None),
        };
        let commit = match repo.find_commit(oid) {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };
        let time = commit.time();
        Ok(chrono::DateTime::from_timestamp(time.seconds(), 0))
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.repo.lock().map_err(|_| Error::ObjectDb("poisoned lock".into()))?;
        *guard = None;
        Ok(())
    }
}
