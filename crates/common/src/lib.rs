//! Shared types for the Waypoint edge router.
//!
//! - [`types`]: endpoints, registry services and accounts
//! - [`names`]: `<namespace>.<type>.<short>` naming rules
//! - [`ids`]: request identifiers

pub mod ids;
pub mod names;
pub mod types;

pub use ids::RequestId;
pub use names::{display_name, Namespace};
pub use types::{Account, Endpoint, EndpointSpec, Node, Service, Value};
