//! Static certificate validation
//!
//! Checks that the configured certificate and key exist and that the
//! certificate has not expired. Skipped when ACME manages certificates.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::{ConfigError, TlsConfig, WaypointConfig};
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Certificates expiring within this window produce a warning.
const EXPIRY_WARNING_WINDOW: Duration = Duration::from_secs(30 * 86400);

/// Startup check of the static TLS section.
///
/// Returns an expiry warning when the certificate is still valid but
/// close to its end date.
pub fn validate_static_tls(config: &WaypointConfig) -> Result<Option<ValidationWarning>, ConfigError> {
    match static_tls(config) {
        Some(tls) => check_tls(tls).map_err(|e| ConfigError::Tls(e.message)),
        None => Ok(None),
    }
}

/// `--test` variant collecting into a [`ValidationResult`].
pub fn validate_certificates(config: &WaypointConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Some(tls) = static_tls(config) {
        match check_tls(tls) {
            Ok(Some(warning)) => result.add_warning(warning),
            Ok(None) => {}
            Err(e) => result.add_error(e),
        }
    }

    result
}

fn static_tls(config: &WaypointConfig) -> Option<&TlsConfig> {
    if config.acme.enabled {
        return None;
    }
    config.tls.as_ref()
}

fn check_tls(tls: &TlsConfig) -> Result<Option<ValidationWarning>, ValidationError> {
    if !tls.cert_file.exists() {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!("Certificate not found: {:?}", tls.cert_file),
        ));
    }

    if !tls.key_file.exists() {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!("Private key not found: {:?}", tls.key_file),
        ));
    }

    load_and_validate_cert(&tls.cert_file)
}

/// Load a certificate and check its expiry
fn load_and_validate_cert(cert_path: &Path) -> Result<Option<ValidationWarning>, ValidationError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read certificate {:?}: {}", cert_path, e),
        )
    })?;

    let pem = pem::parse(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse certificate {:?}: {}", cert_path, e),
        )
    })?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 certificate {:?}: {}", cert_path, e),
        )
    })?;

    let not_after = cert.validity().not_after.timestamp().max(0) as u64;
    let expiry_time = SystemTime::UNIX_EPOCH + Duration::from_secs(not_after);
    let now = SystemTime::now();

    if expiry_time < now {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "Certificate expired: {:?} (expired at {})",
                cert_path,
                cert.validity().not_after
            ),
        ));
    }

    if expiry_time < now + EXPIRY_WARNING_WINDOW {
        return Ok(Some(ValidationWarning::new(format!(
            "Certificate expires soon: {:?} (expires at {})",
            cert_path,
            cert.validity().not_after
        ))));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_self_signed(dir: &Path) -> TlsConfig {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let cert_file = dir.join("cert.pem");
        let key_file = dir.join("key.pem");
        std::fs::write(&cert_file, cert.pem()).unwrap();
        std::fs::write(&key_file, key.serialize_pem()).unwrap();
        TlsConfig { cert_file, key_file }
    }

    #[test]
    fn test_validate_missing_certificate() {
        let config = WaypointConfig {
            tls: Some(TlsConfig {
                cert_file: "/nonexistent/cert.pem".into(),
                key_file: "/nonexistent/key.pem".into(),
            }),
            ..Default::default()
        };

        let result = validate_certificates(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Certificate not found")));

        assert!(matches!(validate_static_tls(&config), Err(ConfigError::Tls(_))));
    }

    #[test]
    fn test_valid_certificate_passes() {
        let dir = tempfile::tempdir().unwrap();
        let config = WaypointConfig {
            tls: Some(write_self_signed(dir.path())),
            ..Default::default()
        };

        // rcgen defaults to a validity far in the future
        assert!(validate_static_tls(&config).unwrap().is_none());
        assert!(validate_certificates(&config).is_ok());
    }

    #[test]
    fn test_ignored_when_acme_enabled() {
        let mut config = WaypointConfig {
            tls: Some(TlsConfig {
                cert_file: "/nonexistent/cert.pem".into(),
                key_file: "/nonexistent/key.pem".into(),
            }),
            ..Default::default()
        };
        config.acme.enabled = true;

        assert!(validate_static_tls(&config).unwrap().is_none());
    }
}
