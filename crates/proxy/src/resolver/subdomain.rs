//! Host-label routing.

use async_trait::async_trait;
use std::net::IpAddr;
use tracing::trace;

use waypoint_common::Endpoint;

use super::{PathResolver, ResolveError, Resolver, RouteQuery, ServiceLookup};

/// Host without a port; IPv6 brackets are removed.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(addr, _)| addr);
    }
    match host.rsplit_once(':') {
        // a bare IPv6 address has several colons and no port
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Registrable domain of a request host, lowercased and without port.
pub fn registrable_domain(host: &str) -> Option<String> {
    let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }
    psl::domain_str(&host).map(str::to_string)
}

/// Service short name carried by the host, if any.
///
/// The labels left of the registrable domain form the name; several labels
/// are reversed and joined with `-` (`staging.foo.example.com` is
/// `foo-staging`). Returns `None` for IP addresses, `localhost`, bare
/// registrable domains, the `api` subdomain and hosts without a public
/// suffix.
pub fn subdomain_name(host: &str) -> Option<String> {
    let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host == "localhost" || host.parse::<IpAddr>().is_ok() {
        return None;
    }

    let domain = psl::domain_str(&host)?;
    let subdomain = host.strip_suffix(domain)?.strip_suffix('.')?;
    if subdomain.is_empty() || subdomain == "api" {
        return None;
    }

    let mut labels: Vec<&str> = subdomain.split('.').collect();
    labels.reverse();
    Some(labels.join("-"))
}

/// Routes `<service>.<registrable domain>` to `<namespace>.<type>.<service>`.
///
/// Hosts without a usable subdomain are resolved by path instead, so the
/// bare domain keeps serving the dashboard and path routes.
#[derive(Debug, Clone)]
pub struct SubdomainResolver {
    lookup: ServiceLookup,
    fallback: PathResolver,
}

impl SubdomainResolver {
    pub fn new(lookup: ServiceLookup) -> Self {
        Self {
            fallback: PathResolver::new(lookup.clone()),
            lookup,
        }
    }
}

#[async_trait]
impl Resolver for SubdomainResolver {
    async fn resolve(&self, query: &RouteQuery) -> Result<Endpoint, ResolveError> {
        match subdomain_name(&query.host) {
            Some(name) => self.lookup.endpoint(&name, query.path.clone()).await,
            None => {
                trace!(host = %query.host, "No subdomain, resolving by path");
                self.fallback.resolve(query).await
            }
        }
    }
}
