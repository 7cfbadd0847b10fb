//! First-path-segment routing.

use async_trait::async_trait;
use tracing::trace;

use waypoint_common::Endpoint;

use super::{is_valid_service_name, ResolveError, Resolver, RouteQuery, ServiceLookup};

/// Split `/name/rest...` into the short name and the forwarded path.
///
/// The forwarded path is `/` followed by the remaining segments, so both
/// `/chat` and `/chat/` forward `/`.
pub fn split_path(path: &str) -> Option<(&str, String)> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (name, rest) = match trimmed.split_once('/') {
        Some((name, rest)) => (name, rest),
        None => (trimmed, ""),
    };

    if !is_valid_service_name(name) {
        return None;
    }
    Some((name, format!("/{rest}")))
}

/// Routes `/<service>/<rest>` to `<namespace>.<type>.<service>`.
#[derive(Debug, Clone)]
pub struct PathResolver {
    lookup: ServiceLookup,
}

impl PathResolver {
    pub fn new(lookup: ServiceLookup) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl Resolver for PathResolver {
    async fn resolve(&self, query: &RouteQuery) -> Result<Endpoint, ResolveError> {
        let Some((name, path)) = split_path(&query.path) else {
            trace!(path = %query.path, "No service segment in path");
            return Err(ResolveError::NotResolved);
        };
        self.lookup.endpoint(name, path).await
    }
}
