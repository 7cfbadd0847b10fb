//! Server, proxy, TLS and ACME KDL parsing.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use crate::{
    default_cache_ttl, default_connect_timeout, default_pool_idle_timeout,
    default_renew_before_days, default_request_timeout, default_shutdown_timeout, AcmeConfig,
    AcmeProvider, ProxyConfig, ResolverKind, ServerConfig, TlsConfig,
};

use super::helpers::{get_bool_entry, get_int_entry, get_string_args, get_string_entry};

/// Parse server configuration block
pub fn parse_server_config(node: &kdl::KdlNode) -> Result<ServerConfig> {
    trace!("Parsing server configuration block");

    let defaults = ServerConfig::default();
    let resolver = match get_string_entry(node, "resolver") {
        Some(name) => name.parse::<ResolverKind>()?,
        None => ResolverKind::default(),
    };

    let config = ServerConfig {
        name: get_string_entry(node, "name").unwrap_or(defaults.name),
        address: get_string_entry(node, "address").unwrap_or(defaults.address),
        namespace: get_string_entry(node, "namespace").unwrap_or(defaults.namespace),
        service_type: get_string_entry(node, "type").unwrap_or(defaults.service_type),
        resolver,
        login_url: get_string_entry(node, "login-url"),
        base_path_header: get_string_entry(node, "base-path-header")
            .unwrap_or(defaults.base_path_header),
        enable_stats: get_bool_entry(node, "enable-stats").unwrap_or(false),
        shutdown_timeout_secs: get_int_entry(node, "shutdown-timeout-secs")
            .map(|v| v as u64)
            .unwrap_or_else(default_shutdown_timeout),
    };

    trace!(
        address = %config.address,
        namespace = %config.namespace,
        resolver = %config.resolver,
        enable_stats = config.enable_stats,
        "Parsed server configuration"
    );

    Ok(config)
}

/// Parse proxy transport block
pub fn parse_proxy_config(node: &kdl::KdlNode) -> Result<ProxyConfig> {
    trace!("Parsing proxy configuration block");

    Ok(ProxyConfig {
        connect_timeout_secs: get_int_entry(node, "connect-timeout-secs")
            .map(|v| v as u64)
            .unwrap_or_else(default_connect_timeout),
        request_timeout_secs: get_int_entry(node, "request-timeout-secs")
            .map(|v| v as u64)
            .unwrap_or_else(default_request_timeout),
        pool_idle_timeout_secs: get_int_entry(node, "pool-idle-timeout-secs")
            .map(|v| v as u64)
            .unwrap_or_else(default_pool_idle_timeout),
    })
}

/// Parse static TLS block
pub fn parse_tls_config(node: &kdl::KdlNode) -> Result<TlsConfig> {
    let cert_file = get_string_entry(node, "cert-file").ok_or_else(|| {
        anyhow::anyhow!("tls block requires 'cert-file', e.g., cert-file \"/etc/waypoint/cert.pem\"")
    })?;
    let key_file = get_string_entry(node, "key-file").ok_or_else(|| {
        anyhow::anyhow!("tls block requires 'key-file', e.g., key-file \"/etc/waypoint/key.pem\"")
    })?;

    Ok(TlsConfig {
        cert_file: PathBuf::from(cert_file),
        key_file: PathBuf::from(key_file),
    })
}

/// Parse ACME block
pub fn parse_acme_config(node: &kdl::KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme configuration block");

    let defaults = AcmeConfig::default();
    let provider = match get_string_entry(node, "provider") {
        Some(name) => name.parse::<AcmeProvider>()?,
        None => AcmeProvider::default(),
    };

    let config = AcmeConfig {
        enabled: get_bool_entry(node, "enabled").unwrap_or(false),
        provider,
        challenge_provider: get_string_entry(node, "challenge-provider")
            .unwrap_or(defaults.challenge_provider),
        ca: get_string_entry(node, "ca").unwrap_or(defaults.ca),
        hosts: get_string_args(node, "hosts"),
        storage: get_string_entry(node, "storage")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage),
        renew_before_days: get_int_entry(node, "renew-before-days")
            .map(|v| v as u32)
            .unwrap_or_else(default_renew_before_days),
        email: get_string_entry(node, "email"),
        challenge_address: get_string_entry(node, "challenge-address")
            .unwrap_or(defaults.challenge_address),
        dns_api_token: None,
    };

    trace!(
        enabled = config.enabled,
        provider = %config.provider,
        host_count = config.hosts.len(),
        "Parsed acme configuration"
    );

    Ok(config)
}

/// Cache TTL of the `directory` block, shared with the directory parser.
pub(crate) fn parse_cache_ttl(node: &kdl::KdlNode) -> u64 {
    get_int_entry(node, "cache-ttl-secs")
        .map(|v| v as u64)
        .unwrap_or_else(default_cache_ttl)
}
