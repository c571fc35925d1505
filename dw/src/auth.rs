//! Token provider
//!
//! Credentials are an external concern; the worker only asks for a valid
//! access token per owner and reacts to the two ways that can fail.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Token retrieval failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// No viable refresh path; needs the owner to reauthorize
    #[error("Authorization invalid: {0}")]
    AuthInvalid(String),

    /// Provider unreachable or rate limited
    #[error("Token provider unavailable: {0}")]
    Unavailable(String),
}

impl TokenError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TokenError::Unavailable(_))
    }
}

/// Hands out access tokens for document owners
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_valid_access_token(&self, owner_id: &str) -> Result<String, TokenError>;
}

/// Local provider: every owner is authorized unless listed as revoked
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    revoked: Mutex<HashSet<String>>,
    failures: Mutex<VecDeque<TokenError>>,
}

impl StaticTokenProvider {
    pub fn new<I, S>(revoked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            revoked: Mutex::new(revoked.into_iter().map(Into::into).collect()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn revoke(&self, owner_id: &str) {
        debug!(%owner_id, "StaticTokenProvider::revoke: called");
        if let Ok(mut revoked) = self.revoked.lock() {
            revoked.insert(owner_id.to_string());
        }
    }

    pub fn reauthorize(&self, owner_id: &str) {
        debug!(%owner_id, "StaticTokenProvider::reauthorize: called");
        if let Ok(mut revoked) = self.revoked.lock() {
            revoked.remove(owner_id);
        }
    }

    /// Make the next token request fail with `err`
    pub fn fail_next(&self, err: TokenError) {
        debug!(?err, "StaticTokenProvider::fail_next: called");
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(err);
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_valid_access_token(&self, owner_id: &str) -> Result<String, TokenError> {
        debug!(%owner_id, "StaticTokenProvider::get_valid_access_token: called");
        let scripted = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(err) = scripted {
            warn!(%owner_id, %err, "StaticTokenProvider::get_valid_access_token: scripted failure");
            return Err(err);
        }

        let revoked = self
            .revoked
            .lock()
            .map_err(|_| TokenError::Unavailable("revocation list poisoned".to_string()))?;
        if revoked.contains(owner_id) {
            return Err(TokenError::AuthInvalid(format!("No refresh token for owner {}", owner_id)));
        }
        Ok(format!("local-{}", owner_id))
    }
}
