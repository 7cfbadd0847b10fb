//! Assembly of the router from one configuration.
//!
//! The build order is fixed: directory, selector, resolver, forwarder, the
//! dashboard fallthrough, the proxy core, the plugins around it, and the
//! access gate outermost.

use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::Layer;
use tracing::{info, warn};

use waypoint_config::{ConfigError, WaypointConfig};

use crate::dashboard::Dashboard;
use crate::error::ProxyError;
use crate::gate::{authorizer_from_config, AccessGateLayer};
use crate::plugins::{compose, HandlerChain, Plugin, RequestStats, StatsPlugin, TracePlugin};
use crate::provisioner::{CertificateProvisioner, ProvisionError};
use crate::proxy::{Forwarder, ProxyCore};
use crate::registry::{self, Directory};
use crate::resolver::{self, Resolver, ServiceLookup};
use crate::selector;
use crate::server::Server;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build the upstream client: {0}")]
    Proxy(#[from] ProxyError),

    #[error("failed to register request statistics: {0}")]
    Stats(#[from] prometheus::Error),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: std::net::SocketAddr,
        source: std::io::Error,
    },
}

/// A fully wired request handler and the parts tests and callers inspect.
#[derive(Debug)]
pub struct App {
    handler: HandlerChain,
    directory: Arc<dyn Directory>,
    resolver: Arc<dyn Resolver>,
    stats: Option<RequestStats>,
}

impl App {
    /// Build with the directory described by the configuration.
    pub fn build(config: &WaypointConfig) -> Result<Self, AppError> {
        Self::with_directory(config, registry::from_config(&config.directory))
    }

    /// Build around an existing directory.
    pub fn with_directory(config: &WaypointConfig, directory: Arc<dyn Directory>) -> Result<Self, AppError> {
        let server = &config.server;
        let namespace = server.routing_namespace();

        let selector = selector::from_kind(config.directory.selector);
        let lookup = ServiceLookup::new(directory.clone(), selector, namespace.clone());
        let resolver = resolver::build(server.resolver, lookup);

        let forwarder = Forwarder::new(&config.proxy, &server.base_path_header)?;
        let authorizer = authorizer_from_config(&config.auth);
        let stats = if server.enable_stats {
            Some(RequestStats::new()?)
        } else {
            None
        };

        let dashboard = Dashboard::new(
            directory.clone(),
            namespace,
            server.resolver,
            authorizer.clone(),
            forwarder.clone(),
        )
        .with_login_url(server.login_url.clone())
        .with_stats(stats.clone());

        let core = ProxyCore::new(resolver.clone(), forwarder, dashboard);

        let mut plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(TracePlugin)];
        if let Some(stats) = &stats {
            plugins.push(Arc::new(StatsPlugin::new(stats.clone())));
        }
        let chain = compose(&plugins, core);

        let gate = AccessGateLayer::new(resolver.clone(), authorizer, server.login_url.as_deref());
        let handler = HandlerChain::new(gate.layer(chain));

        info!(
            name = %server.name,
            namespace = %server.namespace,
            resolver = %server.resolver,
            plugins = ?plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "Router assembled"
        );

        Ok(Self {
            handler,
            directory,
            resolver,
            stats,
        })
    }

    /// The outermost service; clones share all state.
    pub fn handler(&self) -> HandlerChain {
        self.handler.clone()
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub fn stats(&self) -> Option<&RequestStats> {
        self.stats.as_ref()
    }
}

/// Provision certificates, bind, and serve until `cancel` fires.
///
/// Every fatal condition is reported before the listener binds.
pub async fn run(config: &WaypointConfig, cancel: CancellationToken) -> Result<(), AppError> {
    let provisioner = CertificateProvisioner::from_config(config)?;
    let app = App::build(config)?;
    let address = config.server.bind_address()?;

    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| AppError::Bind { address, source })?;
    let background = provisioner.start(cancel.clone()).await?;

    let server = Server::new(app.handler(), provisioner.certificate_source())
        .with_shutdown_timeout(config.server.shutdown_timeout());
    if !server.serve(listener, cancel).await {
        warn!("Shutdown timeout reached with connections still open");
    }

    for task in background {
        task.abort();
    }
    info!("Shutdown complete");
    Ok(())
}
