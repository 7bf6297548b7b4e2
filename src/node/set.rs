//! The live node set.

use super::Node;
use crate::service::ServiceType;
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent map of live nodes keyed by hostname.
///
/// Each hostname maps to at most one node. Readers get snapshots and never observe a
/// half-applied mutation.
#[derive(Debug, Default)]
pub struct NodeSet {
    nodes: DashMap<String, Arc<Node>>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hostname: &str) -> Option<Arc<Node>> {
        self.nodes.get(hostname).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.nodes.contains_key(hostname)
    }

    /// Insert `node` unless its hostname is already present.
    ///
    /// Returns the node that ends up in the set.
    pub fn insert(&self, node: Arc<Node>) -> Arc<Node> {
        self.nodes
            .entry(node.hostname().to_string())
            .or_insert(node)
            .value()
            .clone()
    }

    /// Remove a node. Only one of several concurrent removals gets `Some`.
    pub fn remove(&self, hostname: &str) -> Option<Arc<Node>> {
        self.nodes.remove(hostname).map(|(_, node)| node)
    }

    /// All live nodes, ordered by hostname.
    pub fn snapshot(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self
            .nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.hostname().cmp(b.hostname()));
        nodes
    }

    pub fn hostnames(&self) -> Vec<String> {
        let mut hostnames: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        hostnames.sort();
        hostnames
    }

    /// Live nodes hosting `service_type` for `bucket`, ordered by hostname.
    pub fn hosting(&self, service_type: ServiceType, bucket: Option<&str>) -> Vec<Arc<Node>> {
        self.snapshot()
            .into_iter()
            .filter(|node| node.has_service(service_type, bucket))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
