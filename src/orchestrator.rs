//! The seam between the router and whatever runs the backends

use crate::error::IngestError;
use crate::events::LifecycleEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::net::IpAddr;

/// Ordered stream of lifecycle events.
///
/// An `Err(MalformedEvent)` item is skipped by the ingestor. Any other error
/// item, or the end of the stream, means the subscription is gone.
pub type EventStream = BoxStream<'static, Result<LifecycleEvent, IngestError>>;

/// What the router needs to know about a running container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Container name, possibly with Docker's leading `/`
    pub name: String,
    /// Address on the default bridge network, if any
    pub address: Option<IpAddr>,
    /// Addresses keyed by network name
    pub networks: HashMap<String, IpAddr>,
    /// Exposed port keys such as `"3000/tcp"`
    pub exposed_ports: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    /// Choose the address to route to.
    ///
    /// The default bridge address wins, then the preferred network, then
    /// the first network by name so the choice is stable across restarts.
    pub fn routable_address(&self, preferred_network: Option<&str>) -> Option<IpAddr> {
        if let Some(addr) = self.address {
            return Some(addr);
        }
        if let Some(addr) = preferred_network.and_then(|n| self.networks.get(n)) {
            return Some(*addr);
        }
        let mut names: Vec<&String> = self.networks.keys().collect();
        names.sort();
        names.first().and_then(|n| self.networks.get(*n)).copied()
    }
}

/// Orchestration backend consumed by the ingestor
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Open a new event subscription
    async fn subscribe(&self) -> Result<EventStream, IngestError>;

    /// Fetch current metadata for a container
    async fn inspect(&self, id: &str) -> Result<ContainerInfo, IngestError>;

    /// Ids of all currently running containers
    async fn list_running(&self) -> Result<Vec<String>, IngestError>;
}
