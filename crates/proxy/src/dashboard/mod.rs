//! Built-in dashboard served when a request resolves to no service.
//!
//! Routes are tried in a fixed order:
//!
//! | pattern | response |
//! |---|---|
//! | `/favicon.ico` | empty 200 |
//! | `/not-found` | not-found page |
//! | `/client` | every service with its endpoints |
//! | `/services` | every registered service |
//! | `/service/{name}` | one service, 404 when unknown |
//! | `/stats` | request counters, only with stats enabled |
//! | `/{service}...` | proxy if an endpoint is attached, otherwise not-found |
//! | `/` | index of web services |
//!
//! Listing routes answer with JSON when the request carries
//! `Content-Type: application/json`. Everything else is the not-found page.

pub mod pages;

use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, warn};

use waypoint_common::{display_name, EndpointSpec, Namespace, Service};
use waypoint_config::ResolverKind;

use crate::gate::{request_account, request_token, Authorizer};
use crate::http_helpers::{
    empty_response, gateway_error_response, html_response, json_response, text_response,
    wants_json, ProxyBody,
};
use crate::plugins::RequestStats;
use crate::proxy::{resolved_endpoint, Forwarder};
use crate::registry::Directory;
use crate::resolver::registrable_domain;

use pages::{PageContext, WebService};

/// Path of the statistics page.
pub const STATS_PATH: &str = "/stats";

/// Single leading path segment handed back to the proxy transport.
static SERVICE_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^/[a-zA-Z0-9]+").ok());

fn is_service_prefix(path: &str) -> bool {
    SERVICE_PREFIX
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(path))
}

const CORS_HEADERS: [(&str, &str); 4] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-credentials", "true"),
    ("access-control-allow-methods", "POST, PATCH, GET, OPTIONS, PUT, DELETE"),
    (
        "access-control-allow-headers",
        "Accept, Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization",
    ),
];

#[derive(Debug)]
pub struct Dashboard {
    directory: Arc<dyn Directory>,
    namespace: Namespace,
    resolver: ResolverKind,
    authorizer: Arc<dyn Authorizer>,
    forwarder: Forwarder,
    login_url: Option<String>,
    stats: Option<RequestStats>,
}

/// Request values the handlers need, copied out before any await.
struct Inbound {
    method: Method,
    host: String,
    path: String,
    json: bool,
    user: String,
}

impl Dashboard {
    pub fn new(
        directory: Arc<dyn Directory>,
        namespace: Namespace,
        resolver: ResolverKind,
        authorizer: Arc<dyn Authorizer>,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            directory,
            namespace,
            resolver,
            authorizer,
            forwarder,
            login_url: None,
            stats: None,
        }
    }

    pub fn with_login_url(mut self, login_url: Option<String>) -> Self {
        self.login_url = login_url.filter(|url| !url.is_empty());
        self
    }

    pub fn with_stats(mut self, stats: Option<RequestStats>) -> Self {
        self.stats = stats;
        self
    }

    pub async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let token = request_token(req.headers());
        let user = request_account(self.authorizer.as_ref(), token)
            .await
            .map(|account| account.id)
            .unwrap_or_default();

        let inbound = Inbound {
            method: req.method().clone(),
            host: crate::resolver::RouteQuery::from_request(&req).host,
            path: req.uri().path().to_string(),
            json: wants_json(&req),
            user,
        };
        debug!(path = %inbound.path, "Serving dashboard route");

        match inbound.path.as_str() {
            "/favicon.ico" => empty_response(StatusCode::OK),
            "/not-found" => self.not_found(&inbound),
            "/client" => self.client(&inbound).await,
            "/services" => self.services(&inbound).await,
            STATS_PATH if self.stats.is_some() => self.stats(),
            "/" => self.index(&inbound).await,
            path => {
                if let Some(name) = path
                    .strip_prefix("/service/")
                    .filter(|name| !name.is_empty() && !name.contains('/'))
                {
                    let name = name.to_string();
                    return self.service(&inbound, &name).await;
                }
                if is_service_prefix(path) {
                    return self.catch_all(&inbound, req).await;
                }
                self.not_found(&inbound)
            }
        }
    }

    fn page_context<'a>(&'a self, inbound: &'a Inbound) -> PageContext<'a> {
        PageContext {
            user: &inbound.user,
            login_url: self.login_url.as_deref(),
            stats_url: self.stats.as_ref().map(|_| STATS_PATH),
        }
    }

    fn not_found(&self, inbound: &Inbound) -> Response<ProxyBody> {
        html_response(StatusCode::NOT_FOUND, pages::not_found(&self.page_context(inbound)))
    }

    /// Re-enter the proxy transport for a single-segment path.
    ///
    /// Only a request that already carries an endpoint is forwarded; the
    /// rest get the not-found page.
    async fn catch_all(&self, inbound: &Inbound, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let Some(endpoint) = resolved_endpoint(&req).cloned() else {
            return self.not_found(inbound);
        };
        match self.forwarder.forward(&endpoint, req).await {
            Ok(response) => response,
            Err(e) => gateway_error_response(&e),
        }
    }

    async fn list_services(&self) -> Vec<Service> {
        match self.directory.list_services().await {
            Ok(mut services) => {
                services.sort_by(|a, b| a.name.cmp(&b.name));
                services
            }
            Err(e) => {
                error!(error = %e, "Error listing services");
                Vec::new()
            }
        }
    }

    async fn index(&self, inbound: &Inbound) -> Response<ProxyBody> {
        if inbound.method == Method::OPTIONS {
            return with_cors(empty_response(StatusCode::OK));
        }

        let domain = match self.resolver {
            ResolverKind::Subdomain => registrable_domain(&inbound.host),
            ResolverKind::Path => None,
        };

        let mut web_services: Vec<WebService> = self
            .list_services()
            .await
            .iter()
            .filter_map(|service| self.namespace.short_name(&service.name))
            .map(|short| WebService {
                name: display_name(short),
                link: match &domain {
                    Some(domain) => format!("https://{short}.{domain}"),
                    None => format!("/{short}/"),
                },
            })
            .collect();
        web_services.sort();
        web_services.dedup();

        with_cors(html_response(
            StatusCode::OK,
            pages::index(&self.page_context(inbound), &web_services),
        ))
    }

    async fn services(&self, inbound: &Inbound) -> Response<ProxyBody> {
        let services = self.list_services().await;
        if inbound.json {
            return json_response(StatusCode::OK, &serde_json::json!({ "services": services }));
        }
        html_response(StatusCode::OK, pages::registry(&self.page_context(inbound), &services))
    }

    async fn service(&self, inbound: &Inbound, name: &str) -> Response<ProxyBody> {
        let versions = match self.directory.get_service(name).await {
            Ok(versions) => versions,
            Err(e) => {
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Error occurred: {e}"));
            }
        };
        if versions.is_empty() {
            return text_response(StatusCode::NOT_FOUND, "Not found");
        }

        if inbound.json {
            return json_response(StatusCode::OK, &serde_json::json!({ "services": versions }));
        }
        html_response(StatusCode::OK, pages::service(&self.page_context(inbound), &versions))
    }

    async fn client(&self, inbound: &Inbound) -> Response<ProxyBody> {
        let services = self.list_services().await;
        if inbound.json {
            return json_response(StatusCode::OK, &serde_json::json!({ "services": services }));
        }

        let mut endpoints: BTreeMap<String, Vec<EndpointSpec>> = BTreeMap::new();
        for service in &services {
            if !service.endpoints.is_empty() {
                endpoints.insert(service.name.clone(), service.endpoints.clone());
                continue;
            }
            // listings may omit endpoints; the first registered version has them
            match self.directory.get_service(&service.name).await {
                Ok(versions) => {
                    if let Some(first) = versions.into_iter().next() {
                        endpoints.insert(service.name.clone(), first.endpoints);
                    }
                }
                Err(e) => warn!(service = %service.name, error = %e, "Error fetching service"),
            }
        }

        html_response(StatusCode::OK, pages::client(&self.page_context(inbound), &endpoints))
    }

    fn stats(&self) -> Response<ProxyBody> {
        let Some(stats) = &self.stats else {
            return empty_response(StatusCode::NOT_FOUND);
        };
        match stats.render() {
            Ok(body) => text_response(StatusCode::OK, body),
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Error occurred: {e}")),
        }
    }
}

fn with_cors(mut response: Response<ProxyBody>) -> Response<ProxyBody> {
    for (name, value) in CORS_HEADERS {
        response
            .headers_mut()
            .insert(name, HeaderValue::from_static(value));
    }
    response
}
