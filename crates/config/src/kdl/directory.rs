//! Directory and auth KDL parsing.

use anyhow::Result;
use std::collections::BTreeMap;
use tracing::trace;

use waypoint_common::{EndpointSpec, Node, Service};

use crate::{AuthConfig, DirectoryConfig, SelectorKind};

use super::helpers::{children_named, get_first_arg_string, get_string_entry, prop_string};
use super::server::parse_cache_ttl;

/// Parse directory block
pub fn parse_directory(node: &kdl::KdlNode) -> Result<DirectoryConfig> {
    trace!("Parsing directory configuration block");

    let selector = match get_string_entry(node, "selector") {
        Some(name) => name.parse::<SelectorKind>()?,
        None => SelectorKind::default(),
    };

    let mut services = Vec::new();
    for child in children_named(node, "service") {
        services.push(parse_service(child)?);
    }

    trace!(service_count = services.len(), "Finished parsing directory");

    Ok(DirectoryConfig {
        services,
        selector,
        cache_ttl_secs: parse_cache_ttl(node),
    })
}

fn parse_service(node: &kdl::KdlNode) -> Result<Service> {
    let name = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!(
            "Service requires a name argument, e.g., service \"go.micro.web.chat\" {{ ... }}"
        )
    })?;

    let mut service = Service::new(&name);
    service.version = get_string_entry(node, "version").unwrap_or_default();
    service.metadata = parse_metadata(node);

    for (index, child) in children_named(node, "node").enumerate() {
        let address = get_first_arg_string(child).ok_or_else(|| {
            anyhow::anyhow!(
                "Node of service '{}' requires an address, e.g., node \"10.0.0.7:9000\"",
                name
            )
        })?;
        let id = prop_string(child, "id").unwrap_or_else(|| format!("{name}-{index}"));
        service.nodes.push(Node {
            id,
            address,
            metadata: parse_metadata(child),
        });
    }

    for child in children_named(node, "endpoint") {
        let endpoint_name = get_first_arg_string(child).ok_or_else(|| {
            anyhow::anyhow!("Endpoint of service '{}' requires a name", name)
        })?;
        service.endpoints.push(EndpointSpec {
            name: endpoint_name,
            metadata: parse_metadata(child),
            ..Default::default()
        });
    }

    trace!(
        service = %service.name,
        nodes = service.nodes.len(),
        endpoints = service.endpoints.len(),
        "Parsed service"
    );

    Ok(service)
}

/// `metadata key="value" ...` children, merged.
fn parse_metadata(node: &kdl::KdlNode) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    for child in children_named(node, "metadata") {
        for entry in child.entries() {
            if let (Some(key), Some(value)) = (entry.name(), entry.value().as_string()) {
                metadata.insert(key.value().to_string(), value.to_string());
            }
        }
    }
    metadata
}

/// Parse auth block
pub fn parse_auth(node: &kdl::KdlNode) -> Result<AuthConfig> {
    let mut config = AuthConfig::default();

    for child in children_named(node, "token") {
        let token = get_first_arg_string(child)
            .ok_or_else(|| anyhow::anyhow!("token requires a value, e.g., token \"s3cret\" account=\"alice\""))?;
        let account = prop_string(child, "account")
            .ok_or_else(|| anyhow::anyhow!("token requires an 'account' property"))?;
        config.tokens.insert(token, account);
    }

    for child in children_named(node, "protect") {
        for entry in child.entries().iter().filter(|e| e.name().is_none()) {
            if let Some(service) = entry.value().as_string() {
                config.protected.push(service.to_string());
            }
        }
    }

    trace!(
        tokens = config.tokens.len(),
        protected = config.protected.len(),
        "Parsed auth configuration"
    );

    Ok(config)
}
