//! Concurrent service registry
//!
//! Maps a service name to the endpoint currently serving it. The registry is
//! the only shared routing state: the ingestor writes it, request tasks read
//! it. Entries are stored as `Arc<Endpoint>` so a replacement is a single
//! pointer swap under the shard lock and readers never see a partial entry.

use crate::endpoint::{normalize_service_name, Endpoint};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: DashMap<String, Arc<Endpoint>>,
}

/// Shared handle used by the ingestor, the router and the status API
pub type SharedRegistry = Arc<ServiceRegistry>;

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry wrapped in an `Arc`
    pub fn shared() -> SharedRegistry {
        Arc::new(Self::new())
    }

    /// Insert or replace the entry for the endpoint's service name.
    ///
    /// Returns the entry that was replaced, if any.
    pub fn upsert(&self, endpoint: Endpoint) -> Option<Arc<Endpoint>> {
        let name = endpoint.service_name().to_string();
        let previous = self.entries.insert(name.clone(), Arc::new(endpoint));
        debug!(service = %name, replaced = previous.is_some(), "Registry upsert");
        previous
    }

    /// Look up the endpoint for a service name
    pub fn lookup(&self, service_name: &str) -> Option<Arc<Endpoint>> {
        let key = normalize_service_name(service_name);
        self.entries.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the entry for a service name unconditionally
    pub fn remove(&self, service_name: &str) -> Option<Arc<Endpoint>> {
        let key = normalize_service_name(service_name);
        self.entries.remove(&key).map(|(_, endpoint)| endpoint)
    }

    /// Remove the entry only if it was registered from the given container.
    ///
    /// A late death event for a replaced container leaves the newer entry alone.
    pub fn remove_if_source(&self, service_name: &str, source_id: &str) -> Option<Arc<Endpoint>> {
        let key = normalize_service_name(service_name);
        self.entries
            .remove_if(&key, |_, endpoint| endpoint.source_id() == source_id)
            .map(|(_, endpoint)| endpoint)
    }

    /// Remove every entry registered from the given container
    pub fn remove_by_source(&self, source_id: &str) -> Vec<Arc<Endpoint>> {
        let names: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().source_id() == source_id)
            .map(|entry| entry.key().clone())
            .collect();

        names
            .iter()
            .filter_map(|name| self.remove_if_source(name, source_id))
            .collect()
    }

    /// Drop every entry whose container is not in `live_sources`.
    ///
    /// Returns the removed entries.
    pub fn retain_sources(&self, live_sources: &HashSet<String>) -> Vec<Arc<Endpoint>> {
        let stale: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|entry| !live_sources.contains(entry.value().source_id()))
            .map(|entry| (entry.key().clone(), entry.value().source_id().to_string()))
            .collect();

        stale
            .iter()
            .filter_map(|(name, source)| self.remove_if_source(name, source))
            .collect()
    }

    /// Point-in-time copy of all entries, sorted by service name
    pub fn snapshot(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints: Vec<Arc<Endpoint>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        endpoints.sort_by(|a, b| a.service_name().cmp(b.service_name()));
        endpoints
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
