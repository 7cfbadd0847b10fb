//! Request resolution.
//!
//! A resolver turns `(host, path)` into a concrete [`Endpoint`]: a short
//! service name, one live instance address picked by the selection policy,
//! and the path to forward. Resolution reads the directory and nothing else,
//! so it can be repeated or raced freely.

mod path;
mod subdomain;

pub use path::{split_path, PathResolver};
pub use subdomain::{registrable_domain, subdomain_name, SubdomainResolver};

use async_trait::async_trait;
use http::{header, Request};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::trace;

use waypoint_common::{Endpoint, Namespace};
use waypoint_config::ResolverKind;

use crate::registry::{Directory, DirectoryError};
use crate::selector::SelectionPolicy;

/// Valid service short names.
static SERVICE_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]+([a-zA-Z0-9-]*[a-zA-Z0-9]*)?$").ok());

/// Whether `name` can be a service short name.
pub fn is_valid_service_name(name: &str) -> bool {
    SERVICE_NAME
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

/// The two inputs of resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteQuery {
    /// Request host, possibly with a port
    pub host: String,
    /// Request path without the query string
    pub path: String,
}

impl RouteQuery {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }

    /// Host from the `Host` header, falling back to the URI authority.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();
        Self::new(host, req.uri().path())
    }
}

/// Why a request could not be resolved. Never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no service matches the request")]
    NotResolved,

    #[error("service {0} has no available instance")]
    NoInstanceAvailable(String),

    #[error("directory lookup failed: {0}")]
    Directory(String),
}

impl From<DirectoryError> for ResolveError {
    fn from(e: DirectoryError) -> Self {
        Self::Directory(e.to_string())
    }
}

/// Maps a request to an endpoint.
#[async_trait]
pub trait Resolver: Send + Sync + std::fmt::Debug {
    async fn resolve(&self, query: &RouteQuery) -> Result<Endpoint, ResolveError>;
}

/// Directory lookup and instance selection shared by both strategies.
#[derive(Debug, Clone)]
pub struct ServiceLookup {
    directory: Arc<dyn Directory>,
    selector: Arc<dyn SelectionPolicy>,
    namespace: Namespace,
}

impl ServiceLookup {
    pub fn new(
        directory: Arc<dyn Directory>,
        selector: Arc<dyn SelectionPolicy>,
        namespace: Namespace,
    ) -> Self {
        Self {
            directory,
            selector,
            namespace,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Endpoint for a validated short name.
    pub async fn endpoint(&self, short: &str, path: String) -> Result<Endpoint, ResolveError> {
        if !is_valid_service_name(short) {
            return Err(ResolveError::NotResolved);
        }

        let full_name = self.namespace.full_name(short);
        let versions = self.directory.get_service(&full_name).await?;
        if versions.is_empty() {
            trace!(service = %full_name, "Service not registered");
            return Err(ResolveError::NotResolved);
        }

        let host = self
            .selector
            .pick(&full_name, &versions)
            .map_err(|e| ResolveError::NoInstanceAvailable(e.0))?;

        Ok(Endpoint::new(short, host, path))
    }
}

/// Resolver for the configured strategy.
pub fn build(kind: ResolverKind, lookup: ServiceLookup) -> Arc<dyn Resolver> {
    match kind {
        ResolverKind::Path => Arc::new(PathResolver::new(lookup)),
        ResolverKind::Subdomain => Arc::new(SubdomainResolver::new(lookup)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_pattern() {
        for ok in ["chat", "m3o", "foo-staging", "A1-b2"] {
            assert!(is_valid_service_name(ok), "{ok}");
        }
        for bad in ["", "-chat", "chat_room", "chat.room", "ch at"] {
            assert!(!is_valid_service_name(bad), "{bad}");
        }
    }

    #[test]
    fn test_query_from_request() {
        let req = Request::builder()
            .uri("/chat/messages?since=1")
            .header(header::HOST, "edge.example.com:8082")
            .body(())
            .unwrap();
        let query = RouteQuery::from_request(&req);
        assert_eq!(query, RouteQuery::new("edge.example.com:8082", "/chat/messages"));

        let req = Request::builder()
            .uri("http://alpha.example.com/")
            .body(())
            .unwrap();
        assert_eq!(RouteQuery::from_request(&req).host, "alpha.example.com");
    }
}
