//! Network session negotiation
//!
//! On hosts that must pick a network configuration before sockets are
//! usable, the actor opens a [`NetworkSession`] first. The identifier it
//! settles on is persisted so the next attempt prefers it.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Settings key holding the last configuration that opened successfully
pub const NETWORK_CONFIGURATION_KEY: &str = "default_network_configuration";

/// Network session errors
#[derive(Error, Debug)]
pub enum NetworkSessionError {
    #[error("No usable network configuration (tried: {0})")]
    Unavailable(String),
}

/// Negotiates which local network configuration to use
#[async_trait]
pub trait NetworkSession: Send + Sync {
    /// Open a session, preferring the `saved` configuration when it is
    /// still usable. Returns the identifier of the configuration in use.
    async fn open(&self, saved: Option<String>) -> Result<String, NetworkSessionError>;
}

/// Selects the local interface address outgoing sockets bind to.
///
/// A configuration identifier is an IP address; it is usable when a
/// socket can be bound to it.
#[derive(Debug, Clone, Default)]
pub struct BindSession {
    default: Option<String>,
}

impl BindSession {
    pub fn new(default: Option<String>) -> Self {
        Self { default }
    }

    fn usable(candidate: &str) -> Option<IpAddr> {
        let ip: IpAddr = candidate.trim().parse().ok()?;
        match std::net::TcpListener::bind(SocketAddr::new(ip, 0)) {
            Ok(_) => Some(ip),
            Err(e) => {
                tracing::debug!("Network configuration {} not usable: {}", candidate, e);
                None
            }
        }
    }
}

#[async_trait]
impl NetworkSession for BindSession {
    async fn open(&self, saved: Option<String>) -> Result<String, NetworkSessionError> {
        let system_default = IpAddr::V4(Ipv4Addr::UNSPECIFIED).to_string();
        let candidates: Vec<String> = saved
            .into_iter()
            .chain(self.default.clone())
            .chain(std::iter::once(system_default))
            .collect();

        for candidate in &candidates {
            if let Some(ip) = Self::usable(candidate) {
                return Ok(ip.to_string());
            }
        }

        Err(NetworkSessionError::Unavailable(candidates.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_saved_configuration_preferred() {
        let session = BindSession::new(None);
        let id = session.open(Some("127.0.0.1".to_string())).await.unwrap();
        assert_eq!(id, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_unusable_saved_falls_back() {
        let session = BindSession::new(Some("not-an-address".to_string()));
        let id = session.open(Some("203.0.113.250".to_string())).await.unwrap();
        assert_eq!(id, "0.0.0.0");
    }
}
