//! TTL cache in front of a slower directory.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use waypoint_common::Service;

use super::{Directory, DirectoryError};

#[derive(Debug)]
struct Snapshot {
    fetched_at: Instant,
    services: Arc<Vec<Service>>,
}

/// Caches `list_services` of an inner directory for a fixed TTL.
///
/// Refresh is lazy: the first lookup after expiry fetches a new listing.
/// The lock is never held across the inner call.
#[derive(Debug)]
pub struct CachingDirectory {
    inner: Arc<dyn Directory>,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl CachingDirectory {
    pub fn new(inner: Arc<dyn Directory>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    /// Drop the cached listing.
    pub fn invalidate(&self) {
        *self.snapshot.write() = None;
    }

    fn fresh(&self) -> Option<Arc<Vec<Service>>> {
        let guard = self.snapshot.read();
        guard
            .as_ref()
            .filter(|s| s.fetched_at.elapsed() < self.ttl)
            .map(|s| Arc::clone(&s.services))
    }

    async fn services(&self) -> Result<Arc<Vec<Service>>, DirectoryError> {
        if let Some(services) = self.fresh() {
            trace!("Directory cache hit");
            return Ok(services);
        }

        let services = Arc::new(self.inner.list_services().await?);
        debug!(services = services.len(), "Refreshed directory cache");

        *self.snapshot.write() = Some(Snapshot {
            fetched_at: Instant::now(),
            services: Arc::clone(&services),
        });
        Ok(services)
    }
}

#[async_trait]
impl Directory for CachingDirectory {
    async fn list_services(&self) -> Result<Vec<Service>, DirectoryError> {
        Ok(self.services().await?.as_ref().clone())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, DirectoryError> {
        Ok(self
            .services()
            .await?
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect())
    }
}
