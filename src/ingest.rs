//! Lifecycle event ingestion
//!
//! The ingestor is the only writer of the service registry. It holds one
//! ordered subscription to the orchestrator, applies events one at a time,
//! and contains every per-event failure so a bad event never stops the loop.
//! When the subscription ends it resubscribes with exponential backoff and
//! resyncs the registry against the set of running containers. Running out
//! of resubscribe attempts is the only error that escapes [`Ingestor::run`].

use crate::config::DockerConfig;
use crate::endpoint::{select_port, Endpoint};
use crate::error::IngestError;
use crate::events::{LifecycleEvent, Reachability};
use crate::orchestrator::{ContainerInfo, EventStream, Orchestrator};
use crate::registry::SharedRegistry;
use futures::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Tunables for the ingestor
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub inspect_timeout: Duration,
    pub preferred_network: Option<String>,
    pub port_label: String,
    pub resubscribe_base: Duration,
    pub resubscribe_max: Duration,
    /// 0 means retry forever
    pub max_resubscribe_attempts: u32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from(&DockerConfig::default())
    }
}

impl From<&DockerConfig> for IngestSettings {
    fn from(config: &DockerConfig) -> Self {
        Self {
            inspect_timeout: config.inspect_timeout(),
            preferred_network: config.network.clone(),
            port_label: config.port_label.clone(),
            resubscribe_base: Duration::from_millis(config.resubscribe_base_ms),
            resubscribe_max: Duration::from_millis(config.resubscribe_max_ms),
            max_resubscribe_attempts: config.max_resubscribe_attempts,
        }
    }
}

/// Counters describing the health of the ingestion loop
#[derive(Debug, Default)]
pub struct IngestStatus {
    subscribed: AtomicBool,
    events_received: AtomicU64,
    events_applied: AtomicU64,
    events_skipped: AtomicU64,
    resubscribes: AtomicU64,
    last_error: RwLock<Option<String>>,
}

/// Serializable copy of [`IngestStatus`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestStatusSnapshot {
    pub subscribed: bool,
    pub events_received: u64,
    pub events_applied: u64,
    pub events_skipped: u64,
    pub resubscribes: u64,
    pub last_error: Option<String>,
}

impl IngestStatus {
    fn record_skip(&self, error: &IngestError) {
        self.events_skipped.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> IngestStatusSnapshot {
        IngestStatusSnapshot {
            subscribed: self.subscribed.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            resubscribes: self.resubscribes.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }
}

/// Effect of a single event on the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Registered(Endpoint),
    Removed(Vec<String>),
    Ignored,
}

/// Why a pass over the event stream stopped
enum StreamEnd {
    Shutdown,
    Lost { reason: String, delivered: bool },
}

pub struct Ingestor {
    orchestrator: Arc<dyn Orchestrator>,
    registry: SharedRegistry,
    settings: IngestSettings,
    status: Arc<IngestStatus>,
}

impl Ingestor {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        registry: SharedRegistry,
        settings: IngestSettings,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            settings,
            status: Arc::new(IngestStatus::default()),
        }
    }

    /// Shared status handle (for the status API)
    pub fn status(&self) -> Arc<IngestStatus> {
        Arc::clone(&self.status)
    }

    /// Run until shutdown or until the subscription is lost for good.
    ///
    /// A failure of the very first subscribe is returned immediately.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), IngestError> {
        let mut stream = self.orchestrator.subscribe().await.map_err(|e| {
            IngestError::SubscriptionLost(format!("initial subscribe failed: {}", e))
        })?;
        self.status.subscribed.store(true, Ordering::Relaxed);
        info!("Subscribed to lifecycle events");
        self.resync().await;

        let mut failures = 0u32;
        loop {
            match self.consume(&mut stream, &mut shutdown_rx).await {
                StreamEnd::Shutdown => {
                    info!("Event ingestor shutting down");
                    self.status.subscribed.store(false, Ordering::Relaxed);
                    return Ok(());
                }
                StreamEnd::Lost { reason, delivered } => {
                    self.status.subscribed.store(false, Ordering::Relaxed);
                    *self.status.last_error.write() = Some(reason.clone());
                    if delivered {
                        failures = 0;
                    }
                    match self.resubscribe(&mut shutdown_rx, &mut failures, reason).await? {
                        Some(next) => stream = next,
                        None => return Ok(()),
                    }
                    self.status.subscribed.store(true, Ordering::Relaxed);
                    self.resync().await;
                }
            }
        }
    }

    async fn consume(
        &self,
        stream: &mut EventStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let mut delivered = false;
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        delivered = true;
                        self.process(event).await;
                    }
                    Some(Err(e)) if e.is_fatal() => {
                        return StreamEnd::Lost { reason: e.to_string(), delivered };
                    }
                    Some(Err(e)) => {
                        delivered = true;
                        self.status.events_received.fetch_add(1, Ordering::Relaxed);
                        self.status.record_skip(&e);
                        warn!(error = %e, "Skipping lifecycle event");
                    }
                    None => {
                        return StreamEnd::Lost { reason: "event stream ended".to_string(), delivered };
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return StreamEnd::Shutdown;
                    }
                }
            }
        }
    }

    async fn resubscribe(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        failures: &mut u32,
        mut reason: String,
    ) -> Result<Option<EventStream>, IngestError> {
        let max_attempts = self.settings.max_resubscribe_attempts;
        loop {
            *failures += 1;
            if max_attempts > 0 && *failures > max_attempts {
                error!(attempts = max_attempts, reason = %reason, "Giving up on event subscription");
                return Err(IngestError::SubscriptionLost(format!(
                    "{} (after {} resubscribe attempts)",
                    reason, max_attempts
                )));
            }

            let delay = backoff_delay(
                *failures,
                self.settings.resubscribe_base,
                self.settings.resubscribe_max,
            );
            warn!(attempt = *failures, delay_ms = delay.as_millis() as u64, reason = %reason, "Event subscription lost, resubscribing");
            self.status.resubscribes.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ok(None);
                    }
                }
            }

            match self.orchestrator.subscribe().await {
                Ok(stream) => {
                    info!(attempt = *failures, "Resubscribed to lifecycle events");
                    return Ok(Some(stream));
                }
                Err(e) => reason = e.to_string(),
            }
        }
    }

    /// Handle one event, containing any failure
    async fn process(&self, event: LifecycleEvent) {
        self.status.events_received.fetch_add(1, Ordering::Relaxed);
        match self.handle_event(&event).await {
            Ok(EventOutcome::Ignored) => {
                debug!(kind = %event.kind, action = %event.action, container_id = %event.id, "Ignoring event");
            }
            Ok(_) => {
                self.status.events_applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.status.record_skip(&e);
                warn!(container_id = %event.id, action = %event.action, error = %e, "Skipping lifecycle event");
            }
        }
    }

    /// Apply a single event to the registry
    pub async fn handle_event(&self, event: &LifecycleEvent) -> Result<EventOutcome, IngestError> {
        match event.reachability() {
            Reachability::Reachable => self.register(&event.id).await.map(EventOutcome::Registered),
            Reachability::Unreachable => Ok(EventOutcome::Removed(self.unregister(event))),
            Reachability::Ignored => Ok(EventOutcome::Ignored),
        }
    }

    async fn register(&self, id: &str) -> Result<Endpoint, IngestError> {
        let timeout = self.settings.inspect_timeout;
        let info = tokio::time::timeout(timeout, self.orchestrator.inspect(id))
            .await
            .map_err(|_| IngestError::metadata(id, format!("inspect timed out after {:?}", timeout)))??;

        let endpoint = self.endpoint_from_info(&info)?;
        match endpoint.target() {
            Some(target) => info!(
                service = endpoint.service_name(),
                target = %target,
                container_id = %id,
                "Registering service"
            ),
            None => warn!(
                service = endpoint.service_name(),
                address = %endpoint.address(),
                container_id = %id,
                "Registering service without a TCP port; requests will fail until it exposes one"
            ),
        }
        self.registry.upsert(endpoint.clone());
        Ok(endpoint)
    }

    fn endpoint_from_info(&self, info: &ContainerInfo) -> Result<Endpoint, IngestError> {
        let address = info
            .routable_address(self.settings.preferred_network.as_deref())
            .ok_or_else(|| IngestError::MissingAddress { id: info.id.clone() })?;

        let label = info.labels.get(&self.settings.port_label).map(String::as_str);
        let port = select_port(info.exposed_ports.iter().map(String::as_str), label);

        Endpoint::new(&info.name, address, port, info.id.clone())
            .map_err(|e| IngestError::metadata(&info.id, e))
    }

    fn unregister(&self, event: &LifecycleEvent) -> Vec<String> {
        let removed = match event
            .name()
            .and_then(|name| self.registry.remove_if_source(name, &event.id))
        {
            Some(endpoint) => vec![endpoint],
            // The container may have been renamed since it registered
            None => self.registry.remove_by_source(&event.id),
        };

        let names: Vec<String> = removed
            .iter()
            .map(|e| e.service_name().to_string())
            .collect();
        for name in &names {
            info!(service = %name, container_id = %event.id, action = %event.action, "Removing service");
        }
        names
    }

    /// Rebuild registry state from the running containers.
    ///
    /// Failures are logged; the event stream keeps being consumed either way.
    pub async fn resync(&self) {
        let listed = tokio::time::timeout(self.settings.inspect_timeout, self.orchestrator.list_running()).await;
        let ids = match listed {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to list running containers, skipping resync");
                return;
            }
            Err(_) => {
                warn!("Listing running containers timed out, skipping resync");
                return;
            }
        };

        let live: HashSet<String> = ids.iter().cloned().collect();
        let mut registered = 0usize;
        for id in &ids {
            match self.register(id).await {
                Ok(_) => registered += 1,
                Err(e) => debug!(container_id = %id, error = %e, "Container not routable during resync"),
            }
        }

        let pruned = self.registry.retain_sources(&live);
        for endpoint in &pruned {
            info!(service = endpoint.service_name(), container_id = endpoint.source_id(), "Pruned stale service");
        }
        info!(running = ids.len(), registered, pruned = pruned.len(), "Registry resynced");
    }
}

/// Exponential backoff with up to 10% jitter
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let exponential = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(exponential).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}
