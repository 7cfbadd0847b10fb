//! Instance selection policies.

use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

use waypoint_common::Service;
use waypoint_config::SelectorKind;

/// The service exists but has no instance to send traffic to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no instance available for service {0}")]
pub struct NoInstanceAvailable(pub String);

/// Picks one live instance address among all versions of a service.
pub trait SelectionPolicy: Send + Sync + std::fmt::Debug {
    fn pick(&self, service: &str, versions: &[Service]) -> Result<String, NoInstanceAvailable>;
}

/// Policy configured by name.
pub fn from_kind(kind: SelectorKind) -> Arc<dyn SelectionPolicy> {
    match kind {
        SelectorKind::RoundRobin => Arc::new(RoundRobin::default()),
        SelectorKind::Random => Arc::new(Random),
    }
}

fn addresses(versions: &[Service]) -> Vec<&str> {
    versions
        .iter()
        .flat_map(|s| s.nodes.iter())
        .map(|n| n.address.as_str())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Cycles through instances with a counter per service.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counters: DashMap<String, AtomicUsize>,
}

impl SelectionPolicy for RoundRobin {
    fn pick(&self, service: &str, versions: &[Service]) -> Result<String, NoInstanceAvailable> {
        let candidates = addresses(versions);
        if candidates.is_empty() {
            return Err(NoInstanceAvailable(service.to_string()));
        }

        let index = self
            .counters
            .entry(service.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        Ok(candidates[index % candidates.len()].to_string())
    }
}

/// Uniformly random instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl SelectionPolicy for Random {
    fn pick(&self, service: &str, versions: &[Service]) -> Result<String, NoInstanceAvailable> {
        addresses(versions)
            .choose(&mut rand::thread_rng())
            .map(|a| a.to_string())
            .ok_or_else(|| NoInstanceAvailable(service.to_string()))
    }
}
