//! Configuration validation
//!
//! Fatal startup checks return [`crate::ConfigError`]. The softer checks used
//! by `--test` collect into a [`ValidationResult`] so every problem is
//! reported at once.

pub mod acme;
pub mod certs;
pub mod lint;
pub mod network;

use std::fmt;

use crate::WaypointConfig;

/// Area a validation error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Acme,
    Certificate,
    Network,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acme => write!(f, "acme"),
            Self::Certificate => write!(f, "certificate"),
            Self::Network => write!(f, "network"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Full offline and online check used by `--test`.
///
/// Runs the fatal checks, the certificate and lint passes, and a
/// reachability probe of every statically declared node.
pub async fn check_config(config: &WaypointConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Err(e) = config.server.bind_address() {
        result.add_error(ValidationError::new(ErrorCategory::Network, e.to_string()));
    }
    if let Err(e) = acme::validate_acme(&config.acme) {
        result.add_error(ValidationError::new(ErrorCategory::Acme, e.to_string()));
    }

    result.merge(certs::validate_certificates(config));
    result.merge(lint::lint_config(config));
    result.merge(network::validate_directory(config).await);

    result
}
