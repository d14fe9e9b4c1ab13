//! Dockroute - a reverse proxy that routes to Docker containers by name
//!
//! This library provides a front door for a fleet of containers:
//! - Polls the Docker daemon and derives virtual-host routes from container names
//! - Routes HTTP traffic based on the Host header to the matching container
//! - Relays WebSocket and other protocol upgrades
//! - Tunnels HTTP CONNECT requests (typically SSH) to containers
//! - Uses connection pooling for backend HTTP traffic

pub mod config;
pub mod discovery;
pub mod docker;
pub mod error;
pub mod naming;
pub mod pool;
pub mod proxy;
pub mod routes;
pub mod tunnel;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
