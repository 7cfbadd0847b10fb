//! KDL configuration format.

use anyhow::{Context, Result};
use kdl::KdlDocument;
use tracing::{debug, warn};

use crate::WaypointConfig;

mod directory;
pub mod helpers;
mod server;

pub use directory::{parse_auth, parse_directory};
pub use server::{parse_acme_config, parse_proxy_config, parse_server_config, parse_tls_config};

/// Parse a whole configuration document.
pub fn parse_config(content: &str) -> Result<WaypointConfig> {
    let doc: KdlDocument = content
        .parse()
        .context("configuration is not valid KDL")?;

    let mut config = WaypointConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => config.server = parse_server_config(node)?,
            "proxy" => config.proxy = parse_proxy_config(node)?,
            "tls" => config.tls = Some(parse_tls_config(node)?),
            "acme" => config.acme = parse_acme_config(node)?,
            "directory" => config.directory = parse_directory(node)?,
            "auth" => config.auth = parse_auth(node)?,
            other => warn!(block = %other, "Ignoring unknown configuration block"),
        }
    }

    debug!(
        services = config.directory.services.len(),
        acme = config.acme.enabled,
        tls = config.tls.is_some(),
        "Parsed configuration document"
    );

    Ok(config)
}
