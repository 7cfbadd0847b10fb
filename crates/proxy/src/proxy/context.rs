//! Per-request values carried in `http::Extensions`.

use http::Request;
use std::net::SocketAddr;
use thiserror::Error;

use waypoint_common::Endpoint;

/// The endpoint a request was resolved to.
///
/// Set at most once per request. Whoever resolves first (the access gate or
/// the proxy core) owns the decision; later stages reuse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute(Endpoint);

impl ResolvedRoute {
    pub fn endpoint(&self) -> &Endpoint {
        &self.0
    }
}

/// A second attach was attempted; the first endpoint is kept.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("request already resolved to {existing}")]
pub struct AlreadyResolved {
    pub existing: Endpoint,
}

/// Endpoint attached to the request, if any.
pub fn resolved_endpoint<B>(req: &Request<B>) -> Option<&Endpoint> {
    req.extensions().get::<ResolvedRoute>().map(ResolvedRoute::endpoint)
}

/// Attach an endpoint to a request that has none yet.
pub fn attach_endpoint<B>(req: &mut Request<B>, endpoint: Endpoint) -> Result<(), AlreadyResolved> {
    if let Some(existing) = resolved_endpoint(req) {
        return Err(AlreadyResolved {
            existing: existing.clone(),
        });
    }
    req.extensions_mut().insert(ResolvedRoute(endpoint));
    Ok(())
}

/// Address of the connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);
