//! The request dispatch engine.
//!
//! For every request the core either reuses the endpoint attached upstream,
//! or resolves one itself, then forwards to the backend. Requests that
//! resolve to nothing fall through to the dashboard.

pub mod context;
mod forward;

pub use context::{attach_endpoint, resolved_endpoint, AlreadyResolved, ClientAddr, ResolvedRoute};
pub use forward::Forwarder;

use futures::future::BoxFuture;
use http::{Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, trace};

use waypoint_common::Endpoint;

use crate::dashboard::Dashboard;
use crate::http_helpers::{gateway_error_response, ProxyBody};
use crate::resolver::{Resolver, RouteQuery};

struct CoreInner {
    resolver: Arc<dyn Resolver>,
    forwarder: Forwarder,
    dashboard: Dashboard,
}

/// Cheap to clone; clones share the resolver, client pool and dashboard.
#[derive(Clone)]
pub struct ProxyCore {
    inner: Arc<CoreInner>,
}

impl std::fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCore")
            .field("resolver", &self.inner.resolver)
            .finish_non_exhaustive()
    }
}

impl ProxyCore {
    pub fn new(resolver: Arc<dyn Resolver>, forwarder: Forwarder, dashboard: Dashboard) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                resolver,
                forwarder,
                dashboard,
            }),
        }
    }

    /// Serve one request.
    pub async fn handle(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        let attached = resolved_endpoint(&req).cloned();
        let endpoint = match attached {
            Some(endpoint) => {
                trace!(endpoint = %endpoint, "Using endpoint attached upstream");
                endpoint
            }
            None => {
                let query = RouteQuery::from_request(&req);
                match self.inner.resolver.resolve(&query).await {
                    Ok(endpoint) => {
                        // nothing was attached above, so this cannot fail
                        if let Err(e) = attach_endpoint(&mut req, endpoint.clone()) {
                            debug!(error = %e, "Endpoint attached concurrently");
                        }
                        endpoint
                    }
                    Err(e) => {
                        trace!(host = %query.host, path = %query.path, reason = %e, "Falling through to dashboard");
                        return self.inner.dashboard.handle(req).await;
                    }
                }
            }
        };

        self.proxy(&endpoint, req).await
    }

    async fn proxy(&self, endpoint: &Endpoint, req: Request<ProxyBody>) -> Response<ProxyBody> {
        match self.inner.forwarder.forward(endpoint, req).await {
            Ok(response) => response,
            Err(e) => gateway_error_response(&e),
        }
    }
}

impl tower::Service<Request<ProxyBody>> for ProxyCore {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ProxyBody>) -> Self::Future {
        let core = self.clone();
        Box::pin(async move { Ok(core.handle(req).await) })
    }
}
