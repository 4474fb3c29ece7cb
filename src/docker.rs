//! Docker as the orchestration backend

use crate::error::IngestError;
use crate::events::{subscribed_actions, LifecycleEvent};
use crate::orchestrator::{ContainerInfo, EventStream, Orchestrator};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffered events between the Docker connection and the ingestor
const EVENT_BUFFER: usize = 256;

/// Event source and metadata lookup backed by the Docker Engine API
pub struct DockerOrchestrator {
    client: Docker,
}

impl DockerOrchestrator {
    /// Connect to the Docker daemon, trying in order `docker.host` from the
    /// config, then `DOCKER_HOST`, then bollard's local socket default.
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let env_host = std::env::var("DOCKER_HOST").ok();
        let (client, source) = match docker_host.or(env_host.as_deref()) {
            Some(host) => (Self::connect_to_host(host)?, host.to_string()),
            None => {
                let client = Docker::connect_with_socket_defaults().map_err(|e| {
                    anyhow::anyhow!(
                        "No Docker socket available ({}). Set docker.host or DOCKER_HOST",
                        e
                    )
                })?;
                (client, "default socket".to_string())
            }
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!("Docker daemon at {} is not responding: {}", source, e)
        })?;

        debug!(source = %source, "Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot use Docker socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot use Docker endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Unsupported docker.host '{}': use unix:///path/to/docker.sock or tcp://host:port",
                host
            )
        }
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn subscribe(&self) -> Result<EventStream, IngestError> {
        // Verify the daemon before handing out a stream, so a dead daemon is
        // reported as a subscribe failure rather than an immediately empty stream.
        self.client
            .ping()
            .await
            .map_err(|e| IngestError::SubscriptionLost(format!("Docker daemon unreachable: {}", e)))?;

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("event".to_string(), subscribed_actions());

        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        // The pump owns its own client handle so the stream is 'static.
        // Dropping the receiver stops the pump on its next send.
        let client = self.client.clone();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            let mut events = client.events(Some(options));
            while let Some(result) = events.next().await {
                let item = match result {
                    Ok(message) => event_from_message(message),
                    Err(
                        e @ (bollard::errors::Error::JsonDataError { .. }
                        | bollard::errors::Error::JsonSerdeError { .. }),
                    ) => Err(IngestError::MalformedEvent(e.to_string())),
                    Err(e) => {
                        warn!(error = %e, "Docker event stream failed");
                        let _ = tx.send(Err(IngestError::SubscriptionLost(e.to_string()))).await;
                        return;
                    }
                };
                if tx.send(item).await.is_err() {
                    return;
                }
            }
            debug!("Docker event stream ended");
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, IngestError> {
        let response = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| IngestError::metadata(id, e))?;
        Ok(container_info_from_inspect(id, response))
    }

    async fn list_running(&self) -> Result<Vec<String>, IngestError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| IngestError::metadata("*", e))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

/// Convert a bollard event into the backend-neutral event type
fn event_from_message(message: EventMessage) -> Result<LifecycleEvent, IngestError> {
    let kind = message
        .typ
        .map(|t| t.to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| IngestError::MalformedEvent("missing Type".to_string()))?;
    let action = message
        .action
        .filter(|a| !a.is_empty())
        .ok_or_else(|| IngestError::MalformedEvent("missing Action".to_string()))?;
    let actor = message
        .actor
        .ok_or_else(|| IngestError::MalformedEvent("missing Actor".to_string()))?;
    let id = actor
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| IngestError::MalformedEvent("missing Actor.ID".to_string()))?;

    let mut event = LifecycleEvent::new(kind, action, id);
    event.attributes = actor.attributes.unwrap_or_default();
    Ok(event)
}

fn parse_ip(value: Option<&String>) -> Option<IpAddr> {
    value.filter(|s| !s.is_empty()).and_then(|s| s.parse().ok())
}

/// Pull the routing-relevant fields out of an inspect response
fn container_info_from_inspect(id: &str, response: ContainerInspectResponse) -> ContainerInfo {
    let (exposed_ports, labels) = match response.config {
        Some(config) => {
            let mut ports: Vec<String> = config
                .exposed_ports
                .map(|p| p.into_keys().collect())
                .unwrap_or_default();
            ports.sort();
            (ports, config.labels.unwrap_or_default())
        }
        None => (Vec::new(), HashMap::new()),
    };

    let (address, networks) = match response.network_settings {
        Some(settings) => {
            let address = parse_ip(settings.ip_address.as_ref());
            let networks = settings
                .networks
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(name, endpoint)| {
                    parse_ip(endpoint.ip_address.as_ref())
                        .or_else(|| parse_ip(endpoint.global_ipv6_address.as_ref()))
                        .map(|ip| (name, ip))
                })
                .collect();
            (address, networks)
        }
        None => (None, HashMap::new()),
    };

    ContainerInfo {
        id: response.id.unwrap_or_else(|| id.to_string()),
        name: response.name.unwrap_or_default(),
        address,
        networks,
        exposed_ports,
        labels,
    }
}
