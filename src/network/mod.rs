//! Network module - Handles TCP communication between nodes
//!
//! Provides:
//! - The connection lifecycle state machine (sans I/O)
//! - The actor task that drives it over a socket
//! - Client and server roles built on that actor

mod session;
mod connection;
mod netsession;
mod actor;
mod client;
mod server;

pub use session::*;
pub use connection::*;
pub use netsession::*;
pub use client::*;
pub use server::*;

use std::net::SocketAddr;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Host to connect to (client role)
    pub host: String,
    /// Port to listen on or connect to
    pub port: u16,
    /// Preferred local address to bind outgoing sockets to
    pub bind_address: Option<String>,
    /// Negotiate a network session before dialing
    pub session_required: bool,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Capacity of the command channel
    pub channel_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            bind_address: None,
            session_required: false,
            connect_timeout_ms: 5000,
            channel_capacity: 256,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host((host, port)).await.map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host {}: {}", host, e),
        )
    })?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
