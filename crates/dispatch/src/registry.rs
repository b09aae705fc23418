//! Per-node state: capability snapshot and queue-time statistics.
//!
//! The registry is plain data. It is only ever mutated while the session
//! lock is held, so none of its methods are async.

use std::collections::BTreeMap;

use serde::Serialize;

use scanfleet_core::hashing::sha256_hex;
use scanfleet_core::load::average_queue_time;
use scanfleet_core::types::Timestamp;
use scanfleet_node::capability::CapabilitySnapshot;

use crate::error::DispatchError;

/// State tracked for one configured node.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub address: String,
    pub capabilities: CapabilitySnapshot,
    /// Queue-time samples (ms) since the node last became active.
    pub queue_samples: Vec<u64>,
    /// Files completed since the node last became active.
    pub files_processed: u64,
    /// Average queue time (ms) recorded when the node was last rotated or
    /// evaluated. Zero until then, and reset to zero after a failure.
    pub average_queue_ms: u64,
}

impl NodeState {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    pub fn active_engines(&self) -> usize {
        self.capabilities.active_engines
    }

    /// Average over the current samples, once more than one file has been
    /// processed since the last reset.
    pub fn current_average(&self) -> Option<u64> {
        if self.files_processed <= 1 {
            return None;
        }
        average_queue_time(&self.queue_samples)
    }

    pub fn view(&self) -> NodeView {
        NodeView {
            address: self.address.clone(),
            engines: self.capabilities.engines.len(),
            active_engines: self.capabilities.active_engines,
            oldest_definition: self.capabilities.oldest_definition,
            newest_definition: self.capabilities.newest_definition,
            queue_samples: self.queue_samples.clone(),
            files_processed: self.files_processed,
            average_queue_ms: self.average_queue_ms,
        }
    }
}

/// Read-only copy of a node's state for host reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub address: String,
    pub engines: usize,
    pub active_engines: usize,
    pub oldest_definition: Option<Timestamp>,
    pub newest_definition: Option<Timestamp>,
    pub queue_samples: Vec<u64>,
    pub files_processed: u64,
    pub average_queue_ms: u64,
}

/// All configured nodes keyed by address.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, NodeState>,
}

impl NodeRegistry {
    /// Create one empty node per address.
    pub fn initialize(addresses: &[String]) -> Result<Self, DispatchError> {
        if addresses.is_empty() {
            return Err(DispatchError::StartupConfiguration(
                "no scan node addresses configured".into(),
            ));
        }

        let mut nodes = BTreeMap::new();
        for address in addresses {
            if address.trim().is_empty() {
                return Err(DispatchError::StartupConfiguration(
                    "blank scan node address".into(),
                ));
            }
            if nodes
                .insert(address.clone(), NodeState::new(address))
                .is_some()
            {
                return Err(DispatchError::StartupConfiguration(format!(
                    "duplicate scan node address {address}"
                )));
            }
        }

        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, address: &str) -> Option<&NodeState> {
        self.nodes.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut NodeState> {
        self.nodes.get_mut(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values()
    }

    /// Replace a node's capability snapshot after a successful fetch.
    pub fn apply_refresh(&mut self, address: &str, snapshot: CapabilitySnapshot) {
        if let Some(node) = self.nodes.get_mut(address) {
            node.capabilities = snapshot;
        }
    }

    /// Record a fully successful scan on `address`.
    pub fn record_completion(&mut self, address: &str, queue_time_ms: u64) {
        if let Some(node) = self.nodes.get_mut(address) {
            node.queue_samples.push(queue_time_ms);
            node.files_processed += 1;
        }
    }

    /// Forget samples and file count, e.g. when rotating away from a node.
    pub fn reset_load_stats(&mut self, address: &str) {
        if let Some(node) = self.nodes.get_mut(address) {
            node.queue_samples.clear();
            node.files_processed = 0;
        }
    }

    /// Active engines summed over every node.
    pub fn total_active_engines(&self) -> usize {
        self.nodes.values().map(NodeState::active_engines).sum()
    }

    /// Hash of every node's engine list, versions and definition times.
    pub fn fingerprint(&self) -> String {
        let material: String = self
            .nodes
            .values()
            .map(|n| n.capabilities.fingerprint_material())
            .collect();
        sha256_hex(material.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use scanfleet_core::engine::EngineInfo;
    use scanfleet_core::types::epoch;

    use super::*;

    fn addresses(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn snapshot(engines: &[(&str, &str)], active: usize) -> CapabilitySnapshot {
        CapabilitySnapshot {
            engines: engines
                .iter()
                .map(|(name, version)| {
                    (
                        name.to_string(),
                        EngineInfo {
                            version: version.to_string(),
                            definition_time: epoch(),
                        },
                    )
                })
                .collect(),
            active_engines: active,
            ..Default::default()
        }
    }

    #[test]
    fn initialize_creates_empty_nodes() {
        let registry = NodeRegistry::initialize(&addresses(&["http://a", "http://b"])).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.total_active_engines(), 0);
        assert!(registry.get("http://a").unwrap().capabilities.is_empty());
    }

    #[test]
    fn initialize_rejects_empty_and_duplicates() {
        assert_matches!(
            NodeRegistry::initialize(&[]),
            Err(DispatchError::StartupConfiguration(_))
        );
        assert_matches!(
            NodeRegistry::initialize(&addresses(&["http://a", "http://a"])),
            Err(DispatchError::StartupConfiguration(_))
        );
    }

    #[test]
    fn completion_and_reset() {
        let mut registry = NodeRegistry::initialize(&addresses(&["http://a"])).unwrap();
        registry.record_completion("http://a", 400);
        assert_eq!(registry.get("http://a").unwrap().current_average(), None);

        registry.record_completion("http://a", 600);
        let node = registry.get("http://a").unwrap();
        assert_eq!(node.files_processed, 2);
        assert_eq!(node.current_average(), Some(500));

        registry.reset_load_stats("http://a");
        let node = registry.get("http://a").unwrap();
        assert!(node.queue_samples.is_empty());
        assert_eq!(node.files_processed, 0);
    }

    #[test]
    fn refresh_replaces_snapshot() {
        let mut registry = NodeRegistry::initialize(&addresses(&["http://a", "http://b"])).unwrap();
        registry.apply_refresh("http://a", snapshot(&[("clam", "1")], 1));
        registry.apply_refresh("http://b", snapshot(&[("clam", "1"), ("avira", "8")], 2));
        assert_eq!(registry.total_active_engines(), 3);
    }

    #[test]
    fn fingerprint_tracks_engine_versions() {
        let mut registry = NodeRegistry::initialize(&addresses(&["http://a"])).unwrap();
        registry.apply_refresh("http://a", snapshot(&[("clam", "1")], 1));
        let before = registry.fingerprint();
        assert_eq!(before, registry.fingerprint());

        registry.apply_refresh("http://a", snapshot(&[("clam", "2")], 1));
        assert_ne!(before, registry.fingerprint());
    }
}
