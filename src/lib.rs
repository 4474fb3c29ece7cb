//! Subroute - a subdomain router for Docker containers
//!
//! This library provides a reverse proxy that:
//! - Keeps a service registry in sync with Docker container lifecycle events
//! - Routes HTTP traffic by the first label of the Host header to the
//!   container of the same name
//! - Relays WebSocket (and other HTTP/1.1 upgrade) connections byte for byte
//! - Uses connection pooling for efficient backend communication
//! - Exposes a read-only status API with the routing table

pub mod admin;
pub mod config;
pub mod docker;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod ingest;
pub mod orchestrator;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod router;
