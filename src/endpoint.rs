//! Endpoint descriptors: where a service name currently lives

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};

/// Errors from building an endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("service name is empty")]
    EmptyName,
    #[error("port 0 is not a valid service port")]
    ZeroPort,
}

/// An immutable description of a reachable backend.
///
/// A changed backend is represented by a new `Endpoint` replacing the old
/// one in the registry; nothing here is ever mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    service_name: String,
    address: IpAddr,
    port: Option<u16>,
    source_id: String,
    registered_at: DateTime<Utc>,
}

impl Endpoint {
    /// Build a descriptor. The service name is normalized to lowercase.
    pub fn new(
        service_name: &str,
        address: IpAddr,
        port: Option<u16>,
        source_id: impl Into<String>,
    ) -> Result<Self, EndpointError> {
        let service_name = normalize_service_name(service_name);
        if service_name.is_empty() {
            return Err(EndpointError::EmptyName);
        }
        if port == Some(0) {
            return Err(EndpointError::ZeroPort);
        }

        Ok(Self {
            service_name,
            address,
            port,
            source_id: source_id.into(),
            registered_at: Utc::now(),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Id of the container this descriptor was resolved from
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Socket address to dial, if a port is known
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.port.map(|port| SocketAddr::new(self.address, port))
    }

    /// Base URL of the backend, e.g. `http://10.0.0.5:3000`
    pub fn target(&self) -> Option<String> {
        self.socket_addr().map(|addr| format!("http://{}", addr))
    }

    /// Value for the `Host` header when the origin is rewritten
    pub fn authority(&self) -> Option<String> {
        self.socket_addr().map(|addr| addr.to_string())
    }
}

/// Service names are matched against hostnames, which are case-insensitive
pub fn normalize_service_name(name: &str) -> String {
    name.trim().trim_start_matches('/').to_ascii_lowercase()
}

/// Pick the primary port of a container.
///
/// An explicit label value wins when it parses as a non-zero port. Otherwise
/// the lowest numeric TCP port among the exposed ports (`"3000/tcp"` keys) is
/// used. Exposed keys without a protocol suffix count as TCP, which is what
/// Docker assumes for them.
pub fn select_port<'a, I>(exposed_ports: I, label: Option<&str>) -> Option<u16>
where
    I: IntoIterator<Item = &'a str>,
{
    if let Some(port) = label.and_then(|v| v.trim().parse::<u16>().ok()) {
        if port > 0 {
            return Some(port);
        }
    }

    exposed_ports
        .into_iter()
        .filter_map(|key| {
            let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
            if !proto.eq_ignore_ascii_case("tcp") {
                return None;
            }
            port.parse::<u16>().ok().filter(|p| *p > 0)
        })
        .min()
}
