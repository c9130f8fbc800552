//! Local identity
//!
//! The identity block stamped on every outgoing envelope, and the
//! self-description of this host reported when a connection starts.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Identity of this node as seen by its peers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: String,
    pub group: String,
    pub name: String,
    pub kind: String,
    pub description: String,
}

/// What this host looks like on the network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDescription {
    pub hostname: String,
    pub domain: Option<String>,
    /// Non-loopback addresses first, then loopback
    pub addresses: Vec<IpAddr>,
}

impl HostDescription {
    /// Describe the local host.
    ///
    /// Addresses are whatever the resolver returns for our own hostname,
    /// plus the loopback addresses.
    pub async fn describe() -> Self {
        let full = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_default();

        let (hostname, domain) = match full.split_once('.') {
            Some((host, domain)) if !domain.is_empty() => {
                (host.to_string(), Some(domain.to_string()))
            }
            _ => (full.clone(), None),
        };

        let mut addresses = Vec::new();
        if !full.is_empty() {
            match tokio::net::lookup_host((full.as_str(), 0)).await {
                Ok(resolved) => addresses.extend(resolved.map(|addr| addr.ip())),
                Err(e) => tracing::debug!("Could not resolve own hostname {}: {}", full, e),
            }
        }
        addresses.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
        addresses.push(IpAddr::V6(Ipv6Addr::LOCALHOST));

        Self::from_parts(hostname, domain, addresses)
    }

    /// Build a description, ordering and deduplicating the addresses
    pub fn from_parts(hostname: String, domain: Option<String>, addresses: Vec<IpAddr>) -> Self {
        let mut ordered: Vec<IpAddr> = Vec::with_capacity(addresses.len());
        let (remote, loopback): (Vec<IpAddr>, Vec<IpAddr>) =
            addresses.into_iter().partition(|ip| !ip.is_loopback());

        for ip in remote.into_iter().chain(loopback) {
            if !ordered.contains(&ip) {
                ordered.push(ip);
            }
        }

        Self {
            hostname,
            domain,
            addresses: ordered,
        }
    }

    /// Lines reported through the status sink when connecting to `target`
    pub fn status_lines(&self, target_host: &str, target_port: u16) -> Vec<String> {
        let mut lines = vec![
            format!("Host IP: {}: {}", target_host, target_port),
            "Available addresses:".to_string(),
        ];

        if !self.hostname.is_empty() {
            lines.push(self.hostname.clone());
            if let Some(domain) = &self.domain {
                lines.push(format!("{}.{}", self.hostname, domain));
            }
        }

        if self.hostname != "localhost" {
            lines.push("localhost".to_string());
        }

        lines.extend(self.addresses.iter().map(|ip| ip.to_string()));
        lines
    }
}
