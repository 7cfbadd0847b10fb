//! Waypoint edge router.
//!
//! Public HTTP(S) entry point of a service mesh. Each request is mapped to a
//! service short name (by path prefix or subdomain), the name is looked up
//! in the service directory, one instance is picked, and the request is
//! proxied there with the routing prefix stripped. Requests that map to
//! nothing fall through to a built-in dashboard.
//!
//! # Request flow
//!
//! ```text
//! listener -> AccessGate -> plugins (trace, stats) -> ProxyCore -> backend
//!                                                        \-> dashboard
//! ```
//!
//! The gate resolves the request once and attaches the endpoint; the core
//! reuses it instead of resolving again.
//!
//! # Example
//!
//! ```ignore
//! use waypoint_config::WaypointConfig;
//! use waypoint_proxy::App;
//!
//! let config = WaypointConfig::from_file("waypoint.kdl")?;
//! let app = App::build(&config)?;
//! let handler = app.handler();
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod app;
pub mod dashboard;
pub mod error;
pub mod gate;
pub mod http_helpers;
pub mod plugins;
pub mod provisioner;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod selector;
pub mod server;
pub mod shutdown;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Assembly
pub use app::{run, App, AppError};

// Request handling
pub use gate::{AccessGateLayer, Authorizer};
pub use plugins::{HandlerChain, Plugin, RequestStats};
pub use proxy::{attach_endpoint, resolved_endpoint, ProxyCore, ResolvedRoute};

// Resolution
pub use registry::{CachingDirectory, Directory, DirectoryError, StaticDirectory};
pub use resolver::{ResolveError, Resolver, RouteQuery};
pub use selector::SelectionPolicy;

// Certificates
pub use provisioner::{CertificateProvisioner, ProvisionError};
pub use tls::CertificateSource;

// Errors
pub use error::ProxyError;
