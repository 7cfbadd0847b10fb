//! ACME startup checks.
//!
//! Everything here must fail before a listener binds.

use crate::{AcmeConfig, AcmeProvider, ConfigError, CLOUDFLARE_TOKEN_ENV};

/// DNS challenge providers with an implementation.
pub const SUPPORTED_DNS_PROVIDERS: &[&str] = &["cloudflare"];

/// Check an ACME section. A disabled section is always valid.
pub fn validate_acme(acme: &AcmeConfig) -> Result<(), ConfigError> {
    if !acme.enabled {
        return Ok(());
    }

    if acme.hosts.iter().all(|h| h.trim().is_empty()) {
        return Err(ConfigError::NoAcmeHosts);
    }

    if let Some(host) = acme.hosts.iter().find(|h| h.contains('*')) {
        return Err(ConfigError::Invalid(format!(
            "wildcard host '{host}' cannot be issued; declare each host"
        )));
    }

    if !acme.ca.starts_with("https://") {
        return Err(ConfigError::Invalid(format!(
            "ACME directory '{}' must be an https URL",
            acme.ca
        )));
    }

    match acme.provider {
        AcmeProvider::Http01 => {
            acme.challenge_bind_address()?;
        }
        AcmeProvider::Dns01 => {
            let provider = acme.challenge_provider.to_ascii_lowercase();
            if !SUPPORTED_DNS_PROVIDERS.contains(&provider.as_str()) {
                return Err(ConfigError::UnsupportedChallengeProvider(
                    acme.challenge_provider.clone(),
                ));
            }
            if acme.dns_api_token.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingCredential(CLOUDFLARE_TOKEN_ENV));
            }
        }
    }

    Ok(())
}
