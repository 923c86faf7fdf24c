//! Hosting-provider identity lookups (spec.md §4.4, identity resolver step 3).
//!
//! Distinct from [`crate::adapter::VcsAdapter`]: that trait speaks git
//! transport (`ls-remote`, clone); this one speaks the hosting provider's
//! REST API, which is the only way to learn a repository's stable
//! `external_repo_id` and its *canonical* `(owner, name)` — the values the
//! provider currently considers authoritative, which may differ from the
//! path the caller asked about if a rename raced the request.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

/// The authoritative identity the hosting provider reports for a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalIdentity {
    pub external_repo_id: String,
    pub owner: String,
    pub name: String,
}

#[async_trait]
pub trait HostingProvider: Send + Sync {
    /// Resolves `(owner, name)` to the provider's current canonical identity.
    /// A caller comparing the result against its request (case-insensitively)
    /// detects the race-condition case in spec.md §4.4 step 4.
    async fn resolve_identity(
        &self,
        owner: &str,
        name: &str,
        token: Option<&SecretString>,
    ) -> Result<CanonicalIdentity>;
}

/// GitHub REST API v3 implementation.
pub struct GitHubProvider {
    http: reqwest::Client,
    base_url: String,
}

impl GitHubProvider {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "https://api.github.com".to_string(),
        }
    }

    /// Used by tests to point at a mock server instead of the real API.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for GitHubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct RepoOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    id: i64,
    name: String,
    owner: RepoOwner,
}

#[async_trait]
impl HostingProvider for GitHubProvider {
    async fn resolve_identity(
        &self,
        owner: &str,
        name: &str,
        token: Option<&SecretString>,
    ) -> Result<CanonicalIdentity> {
        use secrecy::ExposeSecret;

        let url = format!("{}/repos/{owner}/{name}", self.base_url);
        let mut req = self
            .http
            .get(&url)
            .header("User-Agent", "specvital-worker")
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = token {
            req = req.bearer_auth(token.expose_secret());
        }

        let response = req.send().await.map_err(|e| Error::Other(anyhow::anyhow!(e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound);
        }
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(Error::AuthFailed);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Other(anyhow::anyhow!(
                "hosting provider API returned {status}"
            )));
        }

        let body: RepoResponse = response.json().await.map_err(|e| Error::Other(anyhow::anyhow!(e)))?;

        Ok(CanonicalIdentity {
            external_repo_id: body.id.to_string(),
            owner: body.owner.login,
            name: body.name,
        })
    }
}
