//! Service directory.
//!
//! The directory owns the set of registered services. Everything else in the
//! router only reads from it.

mod cache;
mod memory;

pub use cache::CachingDirectory;
pub use memory::StaticDirectory;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use waypoint_common::Service;
use waypoint_config::DirectoryConfig;

/// Lookup failure inside a directory. Never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("service directory unavailable: {0}")]
    Unavailable(String),
}

/// Name to instances lookup.
#[async_trait]
pub trait Directory: Send + Sync + std::fmt::Debug {
    /// Every registered service.
    async fn list_services(&self) -> Result<Vec<Service>, DirectoryError>;

    /// All registered versions of one service; empty when unknown.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>, DirectoryError>;
}

/// Directory described by configuration, cached when a TTL is set.
pub fn from_config(config: &DirectoryConfig) -> Arc<dyn Directory> {
    let directory: Arc<dyn Directory> = Arc::new(StaticDirectory::new(config.services.clone()));
    if config.cache_ttl_secs == 0 {
        return directory;
    }
    Arc::new(CachingDirectory::new(directory, config.cache_ttl()))
}
