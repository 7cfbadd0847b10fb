//! Access gate.
//!
//! A tower layer in front of the plugin chain. It resolves the request with
//! the shared resolver, asks the [`Authorizer`] whether the caller may reach
//! the resolved service, and on success attaches the endpoint so the proxy
//! core serves exactly what was authorized.

use async_trait::async_trait;
use http::{header, HeaderMap, Request, Response, StatusCode};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, trace};

use waypoint_common::Account;
use waypoint_config::AuthConfig;

use crate::http_helpers::{cookie, empty_response, redirect, text_response, ProxyBody};
use crate::proxy::context::attach_endpoint;
use crate::resolver::{Resolver, RouteQuery};

/// Cookie carrying the caller's token.
pub const TOKEN_COOKIE: &str = "micro-token";

/// What a request is trying to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// A resolved service, by short name
    Service { name: String, path: String },
    /// An unresolved path served by the router itself
    Path(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service { name, path } => write!(f, "service {name} {path}"),
            Self::Path(path) => write!(f, "path {path}"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("access to {resource} denied")]
pub struct AccessDenied {
    pub resource: String,
}

/// Token inspection and access decisions.
#[async_trait]
pub trait Authorizer: Send + Sync + fmt::Debug {
    /// Account for a token; `None` when the token is unknown.
    async fn inspect(&self, token: &str) -> Option<Account>;

    /// Decide whether `account` may reach `resource`.
    fn verify(&self, account: Option<&Account>, resource: &Resource) -> Result<(), AccessDenied>;
}

/// Lets every request through.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn inspect(&self, _token: &str) -> Option<Account> {
        None
    }

    fn verify(&self, _account: Option<&Account>, _resource: &Resource) -> Result<(), AccessDenied> {
        Ok(())
    }
}

/// Fixed token table plus a set of services that require an account.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthorizer {
    tokens: BTreeMap<String, String>,
    protected: HashSet<String>,
}

impl StaticAuthorizer {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            tokens: config.tokens.clone(),
            protected: config.protected.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn inspect(&self, token: &str) -> Option<Account> {
        self.tokens.get(token).map(Account::new)
    }

    fn verify(&self, account: Option<&Account>, resource: &Resource) -> Result<(), AccessDenied> {
        let protected = match resource {
            Resource::Service { name, .. } => self.protected.contains(name),
            Resource::Path(_) => false,
        };
        if !protected || account.is_some_and(|a| !a.is_anonymous()) {
            return Ok(());
        }
        Err(AccessDenied {
            resource: resource.to_string(),
        })
    }
}

/// Authorizer described by configuration.
pub fn authorizer_from_config(config: &AuthConfig) -> Arc<dyn Authorizer> {
    if config.is_enabled() {
        Arc::new(StaticAuthorizer::new(config))
    } else {
        Arc::new(AllowAll)
    }
}

/// Token from the `micro-token` cookie or an `Authorization: Bearer` header.
pub fn request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = cookie(headers, TOKEN_COOKIE).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Account of the caller, if their token is valid.
pub async fn request_account(authorizer: &dyn Authorizer, token: Option<String>) -> Option<Account> {
    match token {
        Some(token) => authorizer.inspect(&token).await,
        None => None,
    }
}

/// Tower layer installing the access gate.
#[derive(Clone, Debug)]
pub struct AccessGateLayer {
    resolver: Arc<dyn Resolver>,
    authorizer: Arc<dyn Authorizer>,
    login_url: Option<Arc<str>>,
}

impl AccessGateLayer {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        authorizer: Arc<dyn Authorizer>,
        login_url: Option<&str>,
    ) -> Self {
        Self {
            resolver,
            authorizer,
            login_url: login_url.map(Arc::from),
        }
    }
}

impl<S> Layer<S> for AccessGateLayer {
    type Service = AccessGate<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessGate {
            inner,
            layer: self.clone(),
        }
    }
}

/// The service wrapper that performs resolution and authorization.
#[derive(Clone, Debug)]
pub struct AccessGate<S> {
    inner: S,
    layer: AccessGateLayer,
}

impl<S> Service<Request<ProxyBody>> for AccessGate<S>
where
    S: Service<Request<ProxyBody>, Response = Response<ProxyBody>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ProxyBody>) -> Self::Future {
        let layer = self.layer.clone();
        // take the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        // request bodies are not Sync, so nothing borrowed from `req` may live across an await
        let token = request_token(req.headers());
        let query = RouteQuery::from_request(&req);

        Box::pin(async move {
            let account = request_account(layer.authorizer.as_ref(), token).await;

            let (resource, endpoint) = match layer.resolver.resolve(&query).await {
                Ok(endpoint) => (
                    Resource::Service {
                        name: endpoint.name.clone(),
                        path: endpoint.path.clone(),
                    },
                    Some(endpoint),
                ),
                Err(e) => {
                    trace!(error = %e, path = %query.path, "Gate could not resolve request");
                    (Resource::Path(query.path.clone()), None)
                }
            };

            if let Err(denied) = layer.authorizer.verify(account.as_ref(), &resource) {
                debug!(error = %denied, account = ?account.as_ref().map(|a| &a.id), "Access denied");
                return Ok(deny(account.is_some(), layer.login_url.as_deref(), &req));
            }

            if let Some(endpoint) = endpoint {
                if let Err(e) = attach_endpoint(&mut req, endpoint) {
                    debug!(error = %e, "Keeping previously attached endpoint");
                }
            }

            inner.call(req).await
        })
    }
}

/// Response for a denied request.
fn deny<B>(has_account: bool, login_url: Option<&str>, req: &Request<B>) -> Response<ProxyBody> {
    if has_account {
        return text_response(StatusCode::FORBIDDEN, "Forbidden");
    }
    match login_url {
        Some(login) => {
            let original = req.uri().to_string();
            let encoded: String = url::form_urlencoded::byte_serialize(original.as_bytes()).collect();
            let separator = if login.contains('?') { '&' } else { '?' };
            redirect(
                StatusCode::TEMPORARY_REDIRECT,
                &format!("{login}{separator}redirect_to={encoded}"),
            )
        }
        None => empty_response(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_helpers::empty;
    use crate::proxy::context::resolved_endpoint;
    use crate::resolver::{PathResolver, ServiceLookup};
    use crate::registry::StaticDirectory;
    use crate::selector::RoundRobin;
    use std::convert::Infallible;
    use tower::util::BoxCloneService;
    use tower::ServiceExt;
    use waypoint_common::{Endpoint, Namespace, Service};

    fn resolver() -> Arc<dyn Resolver> {
        let directory = StaticDirectory::new(vec![
            Service::new("go.micro.web.chat").with_node("chat-1", "10.0.0.1:9000"),
            Service::new("go.micro.web.admin").with_node("admin-1", "10.0.0.2:9000"),
        ]);
        Arc::new(PathResolver::new(ServiceLookup::new(
            Arc::new(directory),
            Arc::new(RoundRobin::default()),
            Namespace::default(),
        )))
    }

    fn authorizer() -> Arc<dyn Authorizer> {
        let mut config = AuthConfig::default();
        config.tokens.insert("s3cret".to_string(), "alice".to_string());
        config.protected.push("admin".to_string());
        Arc::new(StaticAuthorizer::new(&config))
    }

    /// Inner service echoing the attached endpoint in a header.
    fn echo() -> BoxCloneService<Request<ProxyBody>, Response<ProxyBody>, Infallible> {
        BoxCloneService::new(tower::service_fn(|req: Request<ProxyBody>| async move {
            let attached = resolved_endpoint(&req)
                .map(|e| e.to_string())
                .unwrap_or_else(|| "none".to_string());
            let mut response = empty_response(StatusCode::OK);
            response
                .headers_mut()
                .insert("x-endpoint", attached.parse().unwrap());
            Ok::<_, Infallible>(response)
        }))
    }

    fn request(path: &str) -> Request<ProxyBody> {
        Request::builder().uri(path).body(empty()).unwrap()
    }

    #[tokio::test]
    async fn test_attaches_resolved_endpoint() {
        let gate = AccessGateLayer::new(resolver(), authorizer(), None).layer(echo());
        let response = gate.oneshot(request("/chat/messages")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["x-endpoint"],
            Endpoint::new("chat", "10.0.0.1:9000", "/messages").to_string().as_str()
        );
    }

    #[tokio::test]
    async fn test_resolution_failure_does_not_deny() {
        let gate = AccessGateLayer::new(resolver(), authorizer(), None).layer(echo());
        let response = gate.oneshot(request("/services")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-endpoint"], "none");
    }

    #[tokio::test]
    async fn test_protected_without_token_redirects_to_login() {
        let gate = AccessGateLayer::new(resolver(), authorizer(), Some("https://id.example.com/login"))
            .layer(echo());
        let response = gate.oneshot(request("/admin/users?x=1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://id.example.com/login?redirect_to=%2Fadmin%2Fusers%3Fx%3D1"
        );
    }

    #[tokio::test]
    async fn test_protected_without_login_url_is_unauthorized() {
        let gate = AccessGateLayer::new(resolver(), authorizer(), None).layer(echo());
        let response = gate.oneshot(request("/admin")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_protected_with_token_is_allowed() {
        let gate = AccessGateLayer::new(resolver(), authorizer(), None).layer(echo());
        let req = Request::builder()
            .uri("/admin")
            .header(header::COOKIE, "micro-token=s3cret")
            .body(empty())
            .unwrap();

        let response = gate.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_account_denied_is_forbidden() {
        #[derive(Debug)]
        struct DenyAll;

        #[async_trait]
        impl Authorizer for DenyAll {
            async fn inspect(&self, token: &str) -> Option<Account> {
                Some(Account::new(token))
            }

            fn verify(&self, _: Option<&Account>, resource: &Resource) -> Result<(), AccessDenied> {
                Err(AccessDenied {
                    resource: resource.to_string(),
                })
            }
        }

        let gate = AccessGateLayer::new(resolver(), Arc::new(DenyAll), Some("/login")).layer(echo());
        let req = Request::builder()
            .uri("/chat")
            .header(header::AUTHORIZATION, "Bearer bob")
            .body(empty())
            .unwrap();

        let response = gate.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_request_token_sources() {
        let req = Request::builder()
            .header(header::AUTHORIZATION, "Bearer abc")
            .body(())
            .unwrap();
        assert_eq!(request_token(req.headers()).as_deref(), Some("abc"));

        let req = Request::builder()
            .header(header::COOKIE, "micro-token=xyz")
            .header(header::AUTHORIZATION, "Bearer abc")
            .body(())
            .unwrap();
        assert_eq!(request_token(req.headers()).as_deref(), Some("xyz"));
    }
}
