//! Request middleware composed around the proxy core.
//!
//! Plugins run in registration order: the first plugin sees the request
//! first and the response last. Each plugin turns a [`HandlerChain`] into a
//! new one, so the composed chain is itself a single boxed service.

use http::{HeaderValue, Request, Response};
use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::util::BoxCloneService;
use tower::{Layer, Service};
use tracing::{debug, info_span, Instrument};

use waypoint_common::RequestId;

use crate::http_helpers::ProxyBody;
use crate::proxy::ProxyCore;

/// Header carrying the per-request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The boxed request handler every plugin wraps.
pub type HandlerChain = BoxCloneService<Request<ProxyBody>, Response<ProxyBody>, Infallible>;

/// A middleware transform of the handler chain.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn wrap(&self, next: HandlerChain) -> HandlerChain;
}

/// Wrap `core` in `plugins`, first plugin outermost.
pub fn compose(plugins: &[Arc<dyn Plugin>], core: ProxyCore) -> HandlerChain {
    plugins
        .iter()
        .rev()
        .fold(HandlerChain::new(core), |chain, plugin| {
            debug!(plugin = plugin.name(), "Installing plugin");
            plugin.wrap(chain)
        })
}

// ============================================================================
// Tracing
// ============================================================================

/// Opens a span per request and tags the request with an id.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracePlugin;

impl Plugin for TracePlugin {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn wrap(&self, next: HandlerChain) -> HandlerChain {
        HandlerChain::new(TraceLayer.layer(next))
    }
}

#[derive(Debug, Clone, Copy)]
struct TraceLayer;

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceService { inner }
    }
}

#[derive(Clone)]
struct TraceService<S> {
    inner: S,
}

impl<S> Service<Request<ProxyBody>> for TraceService<S>
where
    S: Service<Request<ProxyBody>, Response = Response<ProxyBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ProxyBody>) -> Self::Future {
        let request_id = match req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(id) => RequestId::from_string(id),
            None => {
                let id = RequestId::new();
                if let Ok(value) = HeaderValue::from_str(id.as_str()) {
                    req.headers_mut().insert(REQUEST_ID_HEADER, value);
                }
                id
            }
        };

        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.uri().path(),
        );
        let started = Instant::now();
        let future = self.inner.call(req);

        Box::pin(
            async move {
                let response = future.await?;
                debug!(
                    status = response.status().as_u16(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Request completed"
                );
                Ok(response)
            }
            .instrument(span),
        )
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Request counters by method and status class.
#[derive(Clone, Debug)]
pub struct RequestStats {
    registry: Registry,
    requests: IntCounterVec,
}

impl RequestStats {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("waypoint_requests_total", "Requests served by the edge router"),
            &["method", "class"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        Ok(Self { registry, requests })
    }

    pub fn record(&self, method: &str, status: u16) {
        let class = match status {
            100..=199 => "1xx",
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.requests.with_label_values(&[method, class]).inc();
    }

    /// Count recorded for one method and class.
    pub fn count(&self, method: &str, class: &str) -> u64 {
        self.requests.with_label_values(&[method, class]).get()
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

/// Counts every response into a [`RequestStats`].
#[derive(Clone, Debug)]
pub struct StatsPlugin {
    stats: RequestStats,
}

impl StatsPlugin {
    pub fn new(stats: RequestStats) -> Self {
        Self { stats }
    }
}

impl Plugin for StatsPlugin {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn wrap(&self, next: HandlerChain) -> HandlerChain {
        HandlerChain::new(StatsService {
            inner: next,
            stats: self.stats.clone(),
        })
    }
}

#[derive(Clone)]
struct StatsService<S> {
    inner: S,
    stats: RequestStats,
}

impl<S> Service<Request<ProxyBody>> for StatsService<S>
where
    S: Service<Request<ProxyBody>, Response = Response<ProxyBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ProxyBody>) -> Self::Future {
        let method = req.method().to_string();
        let stats = self.stats.clone();
        let future = self.inner.call(req);

        Box::pin(async move {
            let response = future.await?;
            stats.record(&method, response.status().as_u16());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_helpers::{empty, empty_response};
    use http::StatusCode;
    use tower::ServiceExt;

    fn status_echo() -> HandlerChain {
        HandlerChain::new(tower::service_fn(|req: Request<ProxyBody>| async move {
            let status = match req.uri().path() {
                "/missing" => StatusCode::NOT_FOUND,
                _ => StatusCode::OK,
            };
            let mut response = empty_response(status);
            if let Some(id) = req.headers().get(REQUEST_ID_HEADER) {
                response.headers_mut().insert(REQUEST_ID_HEADER, id.clone());
            }
            Ok::<_, Infallible>(response)
        }))
    }

    fn get(path: &str) -> Request<ProxyBody> {
        Request::builder().uri(path).body(empty()).unwrap()
    }

    #[tokio::test]
    async fn test_trace_sets_request_id_when_absent() {
        let chain = TracePlugin.wrap(status_echo());
        let response = chain.oneshot(get("/chat")).await.unwrap();
        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert_eq!(id.len(), 36);
    }

    #[tokio::test]
    async fn test_trace_keeps_client_request_id() {
        let chain = TracePlugin.wrap(status_echo());
        let req = Request::builder()
            .uri("/chat")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(empty())
            .unwrap();
        let response = chain.oneshot(req).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "abc-123");
    }

    #[tokio::test]
    async fn test_stats_counts_by_class() {
        let stats = RequestStats::new().unwrap();
        let chain = StatsPlugin::new(stats.clone()).wrap(status_echo());

        chain.clone().oneshot(get("/chat")).await.unwrap();
        chain.clone().oneshot(get("/chat")).await.unwrap();
        chain.oneshot(get("/missing")).await.unwrap();

        assert_eq!(stats.count("GET", "2xx"), 2);
        assert_eq!(stats.count("GET", "4xx"), 1);

        let text = stats.render().unwrap();
        assert!(text.contains("waypoint_requests_total"));
        assert!(text.contains(r#"class="4xx""#));
    }

    /// Records the order in which plugins see a request.
    struct Marker(&'static str, Arc<parking_lot::Mutex<Vec<&'static str>>>);

    impl Plugin for Marker {
        fn name(&self) -> &'static str {
            self.0
        }

        fn wrap(&self, next: HandlerChain) -> HandlerChain {
            let name = self.0;
            let seen = self.1.clone();
            HandlerChain::new(next.map_request(move |req: Request<ProxyBody>| {
                seen.lock().push(name);
                req
            }))
        }
    }

    #[tokio::test]
    async fn test_first_plugin_is_outermost() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let plugins: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(Marker("first", seen.clone())),
            Arc::new(Marker("second", seen.clone())),
        ];

        let chain = plugins
            .iter()
            .rev()
            .fold(status_echo(), |chain, plugin| plugin.wrap(chain));
        chain.oneshot(get("/")).await.unwrap();

        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }
}
