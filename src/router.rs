//! Subdomain routing
//!
//! Every request does a fresh registry lookup; nothing is cached, so a
//! registry update is visible to the very next request.

use crate::endpoint::Endpoint;
use crate::registry::SharedRegistry;
use hyper::Request;
use std::sync::Arc;

/// Maximum DNS hostname length
const MAX_HOSTNAME_LEN: usize = 253;

/// Why a request could not be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No endpoint registered under the subdomain
    NotFound,
    /// Host missing or not a valid hostname
    InvalidHost,
}

/// Result of routing one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    Forward(Arc<Endpoint>),
    Reject(Rejection),
}

impl RoutingDecision {
    /// Base URL of the target, if the decision is to forward to a known port
    pub fn target(&self) -> Option<String> {
        match self {
            RoutingDecision::Forward(endpoint) => endpoint.target(),
            RoutingDecision::Reject(_) => None,
        }
    }
}

/// Reads the registry to route requests by subdomain
#[derive(Debug, Clone)]
pub struct Router {
    registry: SharedRegistry,
}

impl Router {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    /// Route a plain HTTP request.
    ///
    /// The URI authority wins when present (HTTP/2 `:authority`, absolute-form
    /// requests), otherwise the `Host` header is used.
    pub fn route<B>(&self, req: &Request<B>) -> RoutingDecision {
        let host = req
            .uri()
            .host()
            .map(str::to_string)
            .or_else(|| host_header(req));
        self.route_host(host.as_deref())
    }

    /// Route a WebSocket upgrade by its `Host` header
    pub fn route_upgrade<B>(&self, req: &Request<B>) -> RoutingDecision {
        self.route_host(host_header(req).as_deref())
    }

    /// Route by raw host value (`app1.localhost`, `app1.localhost:8080`)
    pub fn route_host(&self, host: Option<&str>) -> RoutingDecision {
        let Some(service) = host.and_then(service_name) else {
            return RoutingDecision::Reject(Rejection::InvalidHost);
        };

        match self.registry.lookup(&service) {
            Some(endpoint) => RoutingDecision::Forward(endpoint),
            None => RoutingDecision::Reject(Rejection::NotFound),
        }
    }
}

fn host_header<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

/// Strip the port and validate a host value, returning it lowercased
pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim();
    // Bracketed IPv6 literals have no subdomain to route on
    if host.starts_with('[') {
        return None;
    }
    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Docker names may contain underscores, so allow them alongside the
    // usual hostname characters. Anything else is rejected before it can
    // reach the logs.
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Service name for a host: everything before the first `.`
pub fn service_name(host: &str) -> Option<String> {
    let hostname = normalize_host(host)?;
    let service = hostname.split('.').next()?;
    if service.is_empty() {
        return None;
    }
    Some(service.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceRegistry;

    fn router_with(entries: &[(&str, &str, Option<u16>)]) -> (Router, SharedRegistry) {
        let registry = ServiceRegistry::shared();
        for (name, addr, port) in entries {
            registry.upsert(Endpoint::new(name, addr.parse().unwrap(), *port, "c").unwrap());
        }
        (Router::new(Arc::clone(&registry)), registry)
    }

    fn request(host: &str) -> Request<()> {
        Request::builder()
            .uri("/path")
            .header("host", host)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_service_name_extraction() {
        assert_eq!(service_name("app1.localhost").as_deref(), Some("app1"));
        assert_eq!(service_name("app1.localhost:8080").as_deref(), Some("app1"));
        assert_eq!(service_name("APP1.Example.COM").as_deref(), Some("app1"));
        assert_eq!(service_name("single").as_deref(), Some("single"));
        assert_eq!(service_name("my_app.localhost").as_deref(), Some("my_app"));
        assert_eq!(service_name(".localhost"), None);
        assert_eq!(service_name(""), None);
        assert_eq!(service_name("bad host.localhost"), None);
        assert_eq!(service_name("[::1]:80"), None);
        assert_eq!(service_name(&"a".repeat(300)), None);
    }

    #[test]
    fn test_round_trip_forward() {
        let (router, _) = router_with(&[("app1", "10.0.0.5", Some(3000))]);
        let decision = router.route(&request("app1.localhost"));
        assert_eq!(decision.target().as_deref(), Some("http://10.0.0.5:3000"));
    }

    #[test]
    fn test_unknown_service_is_not_found() {
        let (router, _) = router_with(&[("app1", "10.0.0.5", Some(3000))]);
        assert_eq!(
            router.route(&request("ghost.localhost")),
            RoutingDecision::Reject(Rejection::NotFound)
        );
    }

    #[test]
    fn test_missing_host_is_invalid() {
        let (router, _) = router_with(&[]);
        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(
            router.route(&req),
            RoutingDecision::Reject(Rejection::InvalidHost)
        );
    }

    #[test]
    fn test_uri_authority_preferred_for_http() {
        let (router, _) = router_with(&[
            ("app1", "10.0.0.5", Some(3000)),
            ("app2", "10.0.0.6", Some(4000)),
        ]);
        let req = Request::builder()
            .uri("http://app2.localhost/path")
            .header("host", "app1.localhost")
            .body(())
            .unwrap();

        assert_eq!(router.route(&req).target().as_deref(), Some("http://10.0.0.6:4000"));
        // Upgrades only look at the Host header
        assert_eq!(router.route_upgrade(&req).target().as_deref(), Some("http://10.0.0.5:3000"));
    }

    #[test]
    fn test_portless_endpoint_still_forwards() {
        let (router, _) = router_with(&[("app1", "10.0.0.5", None)]);
        match router.route(&request("app1.localhost")) {
            RoutingDecision::Forward(endpoint) => assert!(endpoint.port().is_none()),
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn test_routing_is_idempotent_and_sees_updates() {
        let (router, registry) = router_with(&[("app1", "10.0.0.5", Some(3000))]);
        let first = router.route(&request("app1.localhost"));
        let second = router.route(&request("app1.localhost"));
        assert_eq!(first, second);

        registry.upsert(Endpoint::new("app1", "10.0.0.9".parse().unwrap(), Some(3001), "c2").unwrap());
        assert_eq!(
            router.route(&request("app1.localhost")).target().as_deref(),
            Some("http://10.0.0.9:3001")
        );

        registry.remove("app1");
        assert_eq!(
            router.route(&request("app1.localhost")),
            RoutingDecision::Reject(Rejection::NotFound)
        );
    }
}
