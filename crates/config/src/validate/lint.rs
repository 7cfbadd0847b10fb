//! Configuration linting
//!
//! Flags settings that are legal but probably not what the operator meant.

use super::{ValidationResult, ValidationWarning};
use crate::{AcmeProvider, ResolverKind, WaypointConfig};

/// Lint configuration
pub fn lint_config(config: &WaypointConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.acme.enabled && config.tls.is_some() {
        result.add_warning(ValidationWarning::new(
            "Both ACME and static TLS are configured; the static certificate is ignored",
        ));
    }

    if config.acme.enabled
        && config.acme.provider == AcmeProvider::Http01
        && !config.acme.challenge_address.ends_with(":80")
    {
        result.add_warning(ValidationWarning::new(format!(
            "HTTP-01 challenge listener '{}' is not on port 80; the CA only validates port 80 unless traffic is forwarded",
            config.acme.challenge_address
        )));
    }

    if config.acme.enabled && config.server.resolver == ResolverKind::Path {
        result.add_warning(ValidationWarning::new(
            "ACME is enabled with the path resolver; dashboard links will not use service subdomains",
        ));
    }

    if config.auth.tokens.is_empty() && !config.auth.protected.is_empty() {
        result.add_warning(ValidationWarning::new(
            "Services are protected but no tokens are configured; every request to them is refused",
        ));
    }

    if !config.auth.protected.is_empty() && config.server.login_url.is_none() {
        result.add_warning(ValidationWarning::new(
            "Protected services without a login-url answer 401 instead of redirecting",
        ));
    }

    let prefix = config.server.routing_namespace().prefix();
    for service in &config.directory.services {
        if !service.name.starts_with(&format!("{prefix}.")) {
            result.add_warning(ValidationWarning::new(format!(
                "Service '{}' is outside the routing namespace '{}' and is not routable",
                service.name, prefix
            )));
        }

        if service.nodes.is_empty() {
            result.add_warning(ValidationWarning::new(format!(
                "Service '{}' has no nodes (requests resolve to not-found)",
                service.name
            )));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TlsConfig;
    use waypoint_common::Service;

    #[test]
    fn test_lint_acme_with_static_tls() {
        let mut config = WaypointConfig {
            tls: Some(TlsConfig::default()),
            ..Default::default()
        };
        config.acme.enabled = true;

        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("static certificate is ignored")));
    }

    #[test]
    fn test_lint_service_outside_namespace() {
        let mut config = WaypointConfig::default();
        config.directory.services = vec![
            Service::new("go.micro.web.chat").with_node("chat-1", "127.0.0.1:9000"),
            Service::new("go.micro.srv.store").with_node("store-1", "127.0.0.1:9001"),
        ];

        let result = lint_config(&config);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("go.micro.srv.store"));
    }

    #[test]
    fn test_lint_service_without_nodes() {
        let mut config = WaypointConfig::default();
        config.directory.services = vec![Service::new("go.micro.web.chat")];

        let result = lint_config(&config);
        assert!(result.warnings.iter().any(|w| w.message.contains("no nodes")));
    }

    #[test]
    fn test_default_config_is_quiet() {
        assert!(lint_config(&WaypointConfig::default()).warnings.is_empty());
    }
}
