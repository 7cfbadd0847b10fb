//! Core data model shared by the directory, resolver and proxy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Routing
// ============================================================================

/// A concrete backend target produced by resolution.
///
/// An endpoint lives for exactly one request. `host` is always a live
/// instance address picked by the selection policy, never a service name,
/// and `path` is what gets forwarded to that instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Short service name (e.g. `chat` for `go.micro.web.chat`)
    pub name: String,
    /// Instance address, `host:port`
    pub host: String,
    /// Path to forward to the backend
    pub path: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            path: path.into(),
        }
    }

    /// Value of the base-path header sent to the backend.
    pub fn base_path(&self) -> String {
        format!("/{}", self.name)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}{}", self.name, self.host, self.path)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A registered service as reported by the directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Fully qualified registry name, e.g. `go.micro.web.chat`
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_node(mut self, id: impl Into<String>, address: impl Into<String>) -> Self {
        self.nodes.push(Node {
            id: id.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
        });
        self
    }

    pub fn with_endpoint(mut self, endpoint: EndpointSpec) -> Self {
        self.endpoints.push(endpoint);
        self
    }
}

/// A single running instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// An RPC endpoint advertised by a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Type description of an endpoint request or response field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
}

impl Value {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            values: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: Value) -> Self {
        self.values.push(field);
        self
    }
}

// ============================================================================
// Access control
// ============================================================================

/// Caller identity derived from an auth token.
///
/// Never stored by the proxy; it exists only while a request is
/// being authorized or a dashboard page is rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub id: String,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// An account without an id is anonymous.
    pub fn is_anonymous(&self) -> bool {
        self.id.is_empty()
    }
}
