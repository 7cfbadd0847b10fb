//! Directory reachability validation
//!
//! Probes every statically declared node with a TCP connect.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::WaypointConfig;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Validate node connectivity
pub async fn validate_directory(config: &WaypointConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    for service in &config.directory.services {
        for node in &service.nodes {
            match timeout(PROBE_TIMEOUT, TcpStream::connect(&node.address)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    result.add_error(ValidationError::new(
                        ErrorCategory::Network,
                        format!(
                            "Service '{}' node '{}' unreachable: {}",
                            service.name, node.address, e
                        ),
                    ));
                }
                Err(_) => {
                    result.add_warning(ValidationWarning::new(format!(
                        "Service '{}' node '{}' connection timeout ({}s)",
                        service.name,
                        node.address,
                        PROBE_TIMEOUT.as_secs()
                    )));
                }
            }
        }
    }

    result
}
