//! Peer registry
//!
//! Last-known descriptor of every remote node, keyed by IP and port.
//! Owned by a single connection actor.

use std::collections::BTreeMap;

use crate::protocol::NodeInfo;

#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    nodes: BTreeMap<String, BTreeMap<u16, NodeInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the descriptor for `(info.ip, info.port)`.
    ///
    /// An existing entry is overwritten as a whole. Returns `true` if the
    /// address was not known before.
    pub fn upsert(&mut self, info: NodeInfo) -> bool {
        let ports = self.nodes.entry(info.ip.clone()).or_default();
        ports.insert(info.port, info).is_none()
    }

    pub fn get(&self, ip: &str, port: u16) -> Option<&NodeInfo> {
        self.nodes.get(ip).and_then(|ports| ports.get(&port))
    }

    /// Find a node by the name it identified with
    pub fn find_by_name(&self, name: &str) -> Option<&NodeInfo> {
        self.iter().find(|info| info.name == name)
    }

    /// All descriptors, ordered by IP then port
    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values().flat_map(|ports| ports.values())
    }

    /// Owned snapshot for collaborators
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.iter().cloned().collect()
    }

    /// Names of every known node
    pub fn names(&self) -> Vec<String> {
        self.iter().map(|info| info.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, ip: &str, port: u16) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            ip: ip.to_string(),
            port,
            ..Default::default()
        }
    }

    #[test]
    fn test_same_address_overwrites() {
        let mut registry = PeerRegistry::new();
        assert!(registry.upsert(NodeInfo {
            group: "old-group".into(),
            ..node("first", "10.0.0.2", 5000)
        }));
        assert!(!registry.upsert(node("second", "10.0.0.2", 5000)));

        assert_eq!(registry.len(), 1);
        let info = registry.get("10.0.0.2", 5000).unwrap();
        assert_eq!(info.name, "second");
        assert_eq!(info.group, "");
    }

    #[test]
    fn test_distinct_ports_are_distinct_peers() {
        let mut registry = PeerRegistry::new();
        registry.upsert(node("a", "10.0.0.2", 5000));
        registry.upsert(node("b", "10.0.0.2", 5001));
        registry.upsert(node("c", "10.0.0.1", 5000));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names(), vec!["c", "a", "b"]);
        assert_eq!(registry.find_by_name("b").map(|n| n.port), Some(5001));
    }

    #[test]
    fn test_clear() {
        let mut registry = PeerRegistry::new();
        registry.upsert(node("a", "10.0.0.2", 5000));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.get("10.0.0.2", 5000).is_none());
    }
}
