//! Outbound request rewriting and transport.
//!
//! Upgrade requests (WebSocket and friends) keep their `Connection` and
//! `Upgrade` headers. When the backend answers 101 the two upgraded
//! connections are spliced together in a background task.

use http::header::{self, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;
use tracing::{debug, warn};

use waypoint_common::Endpoint;
use waypoint_config::ProxyConfig;

use super::context::ClientAddr;
use crate::error::ProxyError;
use crate::http_helpers::{restore_upgrade, strip_hop_by_hop, upgrade_protocol, ProxyBody};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Rewrites requests for an endpoint and sends them over a pooled client.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct Forwarder {
    client: Client<HttpConnector, ProxyBody>,
    base_path_header: HeaderName,
    request_timeout: Duration,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig, base_path_header: &str) -> Result<Self, ProxyError> {
        let base_path_header = HeaderName::from_bytes(base_path_header.as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(format!("base path header: {e}")))?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout()));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout())
            .build(connector);

        Ok(Self {
            client,
            base_path_header,
            request_timeout: config.request_timeout(),
        })
    }

    /// Rewrite a request so that it targets `endpoint`.
    ///
    /// Sets the base-path header, points authority and `Host` at the
    /// instance, replaces the path while keeping the query, and forces
    /// cleartext HTTP/1.1. An upgrade request keeps its upgrade headers.
    pub fn rewrite(
        &self,
        endpoint: &Endpoint,
        req: Request<ProxyBody>,
    ) -> Result<Request<ProxyBody>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        let target = match parts.uri.query() {
            Some(query) => format!("http://{}{}?{}", endpoint.host, endpoint.path, query),
            None => format!("http://{}{}", endpoint.host, endpoint.path),
        };
        parts.uri = target
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidRequest(format!("{target}: {e}")))?;
        parts.version = Version::HTTP_11;

        let upgrade = upgrade_protocol(&parts.headers);
        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = upgrade {
            restore_upgrade(&mut parts.headers, protocol);
        }

        let host = HeaderValue::from_str(&endpoint.host)
            .map_err(|e| ProxyError::InvalidRequest(format!("host {}: {e}", endpoint.host)))?;
        parts.headers.insert(header::HOST, host);

        let base_path = HeaderValue::from_str(&endpoint.base_path())
            .map_err(|e| ProxyError::InvalidRequest(format!("base path: {e}")))?;
        parts.headers.insert(self.base_path_header.clone(), base_path);

        if let Some(ClientAddr(peer)) = parts.extensions.get::<ClientAddr>().copied() {
            let forwarded = match parts.headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{prior}, {}", peer.ip()),
                None => peer.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                parts.headers.insert(X_FORWARDED_FOR, value);
            }
        }

        Ok(Request::from_parts(parts, body))
    }

    /// Forward a request to `endpoint` and stream the response back.
    pub async fn forward(
        &self,
        endpoint: &Endpoint,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let client_upgrade = upgrade_protocol(req.headers()).map(|_| hyper::upgrade::on(&mut req));
        let outbound = self.rewrite(endpoint, req)?;
        debug!(endpoint = %endpoint, method = %outbound.method(), "Forwarding request");

        let mut response = tokio::time::timeout(self.request_timeout, self.client.request(outbound))
            .await
            .map_err(|_| {
                warn!(endpoint = %endpoint, timeout_secs = self.request_timeout.as_secs(), "Backend timed out");
                ProxyError::Timeout {
                    host: endpoint.host.clone(),
                    timeout: self.request_timeout,
                }
            })?
            .map_err(|e| {
                warn!(endpoint = %endpoint, error = %e, "Backend request failed");
                ProxyError::Upstream {
                    host: endpoint.host.clone(),
                    message: e.to_string(),
                }
            })?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            return Ok(Response::from_parts(parts, body.boxed_unsync()));
        }

        let (Some(client_upgrade), Some(protocol)) = (client_upgrade, upgrade_protocol(response.headers())) else {
            return Err(ProxyError::Upstream {
                host: endpoint.host.clone(),
                message: "switched protocols without an upgrade request".to_string(),
            });
        };
        let backend_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(splice(endpoint.clone(), client_upgrade, backend_upgrade));

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        restore_upgrade(&mut parts.headers, protocol);
        Ok(Response::from_parts(parts, body.boxed_unsync()))
    }
}

/// Copy bytes both ways between the upgraded client and backend connections.
async fn splice(endpoint: Endpoint, client: OnUpgrade, backend: OnUpgrade) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "Connection upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, to_client)) => debug!(
            endpoint = %endpoint,
            to_backend,
            to_client,
            "Upgraded connection closed"
        ),
        Err(e) => debug!(endpoint = %endpoint, error = %e, "Upgraded connection ended"),
    }
}
