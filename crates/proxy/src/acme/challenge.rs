//! Pending HTTP-01 challenge responses.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Path prefix the CA fetches tokens from.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Token to key-authorization table served by the challenge listener.
///
/// Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct ChallengeStore {
    pending: Arc<DashMap<String, String>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Serving HTTP-01 challenge");
        self.pending
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn remove(&self, token: &str) {
        if self.pending.remove(token).is_some() {
            debug!(token = %token, "Withdrew HTTP-01 challenge");
        }
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.pending.get(token).map(|entry| entry.value().clone())
    }

    /// Token named by a request path, if it is a challenge path.
    pub fn token_from_path(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }

    /// Whether `path` falls under the challenge prefix at all.
    pub fn is_challenge_path(path: &str) -> bool {
        path.starts_with(ACME_CHALLENGE_PREFIX)
    }

    /// Key authorization to answer a challenge request with.
    pub fn response_for(&self, path: &str) -> Option<String> {
        let token = Self::token_from_path(path)?;
        let response = self.get(token);
        trace!(token = %token, found = response.is_some(), "Challenge lookup");
        response
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
