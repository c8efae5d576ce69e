//! Immutable cluster topology snapshot

use std::sync::Arc;

use super::config_map::{ClusterMap, Locator, NodeAddress};
use super::key_mapper::{KeyMapper, Route};
use super::node::ClusterNode;
use crate::utils::ClusterError;

/// One revision of the cluster: nodes plus the key mapper built for them
///
/// Readers hold an `Arc<Topology>`; a newer revision replaces the snapshot
/// wholesale and never mutates this one.
#[derive(Debug)]
pub struct Topology {
    map: ClusterMap,
    nodes: Vec<Arc<ClusterNode>>,
    mapper: Arc<KeyMapper>,
}

impl Topology {
    pub(crate) fn new(map: ClusterMap, nodes: Vec<Arc<ClusterNode>>, mapper: Arc<KeyMapper>) -> Self {
        debug_assert_eq!(map.nodes.len(), nodes.len());
        Self { map, nodes, mapper }
    }

    pub fn revision(&self) -> u64 {
        self.map.revision
    }

    pub fn bucket(&self) -> &str {
        &self.map.bucket
    }

    pub fn locator(&self) -> Locator {
        self.mapper.locator()
    }

    pub fn map(&self) -> &ClusterMap {
        &self.map
    }

    pub fn mapper(&self) -> &Arc<KeyMapper> {
        &self.mapper
    }

    pub fn nodes(&self) -> &[Arc<ClusterNode>] {
        &self.nodes
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: usize) -> Option<&Arc<ClusterNode>> {
        self.nodes.get(index)
    }

    pub fn node_by_address(&self, address: &NodeAddress) -> Option<&Arc<ClusterNode>> {
        self.nodes
            .iter()
            .find(|n| n.address().host == address.host && n.address().kv_port == address.kv_port)
    }

    /// Resolve a key (or replica `n` of it) to a node of this snapshot
    pub fn route(&self, key: &[u8], replica: Option<usize>) -> Result<(Route, Arc<ClusterNode>), ClusterError> {
        let route = match replica {
            Some(n) => self.mapper.map_replica(key, n)?,
            None => self.mapper.map_key(key)?,
        };
        let node = self
            .nodes
            .get(route.node)
            .cloned()
            .ok_or_else(|| ClusterError::NodeNotFound(format!("index {}", route.node)))?;
        Ok((route, node))
    }

    /// Target for commands that are not bound to a key: the first live
    /// node, or the first node if none is known to be alive
    pub fn any_node(&self) -> Result<Arc<ClusterNode>, ClusterError> {
        self.nodes
            .iter()
            .find(|n| n.is_alive())
            .or_else(|| self.nodes.first())
            .cloned()
            .ok_or(ClusterError::NoNodes)
    }
}
