//! OAuth token lookup for the Analyze Pipeline (spec.md §4.6 step 1).
//!
//! Not part of the data model in spec.md §3 — this is store-agnostic glue to
//! whatever credential vault a deployment wires in; the worker crate only
//! needs the narrow trait below. "Token not found" degrades gracefully to an
//! unauthenticated clone; only an infrastructure-level failure is retryable.

use async_trait::async_trait;
use secrecy::SecretString;
use uuid::Uuid;

#[async_trait]
pub trait OAuthTokenStore: Send + Sync {
    /// `Ok(None)` means "no token on file for this user" (proceed
    /// unauthenticated). `Err` means the lookup itself failed (retryable).
    async fn get_token(&self, user_id: Uuid) -> anyhow::Result<Option<SecretString>>;
}

/// A store with no tokens on file for anyone — every user analyzes
/// unauthenticated. Used by binaries and tests that don't wire a real vault.
pub struct NoTokensStore;

#[async_trait]
impl OAuthTokenStore for NoTokensStore {
    async fn get_token(&self, _user_id: Uuid) -> anyhow::Result<Option<SecretString>> {
        Ok(None)
    }
}
