//! In-memory directory snapshot.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use waypoint_common::Service;

use super::{Directory, DirectoryError};

/// Directory backed by an atomically swappable service list.
///
/// Readers never block: each lookup loads the current snapshot, and
/// updates publish a whole new list.
#[derive(Debug)]
pub struct StaticDirectory {
    services: ArcSwap<Vec<Service>>,
}

impl StaticDirectory {
    pub fn new(services: Vec<Service>) -> Self {
        info!(services = services.len(), "Initialized static service directory");
        Self {
            services: ArcSwap::from_pointee(services),
        }
    }

    /// Replace the whole snapshot.
    pub fn replace(&self, services: Vec<Service>) {
        debug!(services = services.len(), "Replacing directory snapshot");
        self.services.store(Arc::new(services));
    }

    /// Add a service version, replacing one with the same name and version.
    pub fn register(&self, service: Service) {
        self.services.rcu(|current| {
            let mut next: Vec<Service> = current
                .iter()
                .filter(|s| !(s.name == service.name && s.version == service.version))
                .cloned()
                .collect();
            next.push(service.clone());
            next
        });
        debug!(service = %service.name, version = %service.version, "Registered service");
    }

    /// Remove every version of a service.
    pub fn deregister(&self, name: &str) {
        self.services.rcu(|current| {
            current
                .iter()
                .filter(|s| s.name != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        debug!(service = %name, "Deregistered service");
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn list_services(&self) -> Result<Vec<Service>, DirectoryError> {
        Ok(self.services.load().as_ref().clone())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, DirectoryError> {
        Ok(self
            .services
            .load()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(version: &str, address: &str) -> Service {
        let mut service = Service::new("go.micro.web.chat").with_node("chat", address);
        service.version = version.to_string();
        service
    }

    #[tokio::test]
    async fn test_get_service_returns_all_versions() {
        let directory = StaticDirectory::new(vec![
            chat("1.0.0", "10.0.0.1:9000"),
            chat("2.0.0", "10.0.0.2:9000"),
            Service::new("go.micro.web.blog"),
        ]);

        let versions = directory.get_service("go.micro.web.chat").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(directory.get_service("go.micro.web.none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_replaces_same_version() {
        let directory = StaticDirectory::default();
        directory.register(chat("1.0.0", "10.0.0.1:9000"));
        directory.register(chat("1.0.0", "10.0.0.9:9000"));

        let versions = directory.get_service("go.micro.web.chat").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].nodes[0].address, "10.0.0.9:9000");
    }

    #[tokio::test]
    async fn test_deregister() {
        let directory = StaticDirectory::new(vec![chat("1.0.0", "10.0.0.1:9000")]);
        directory.deregister("go.micro.web.chat");
        assert!(directory.list_services().await.unwrap().is_empty());
    }
}
