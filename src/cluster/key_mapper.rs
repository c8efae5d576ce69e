//! Key to node routing
//!
//! The mapper is picked from the cluster map's locator and is immutable; a
//! new one is built only when the map's layout actually changes.

use super::config_map::{ClusterMap, Locator};
use super::ketama::Continuum;
use super::vbucket::VBucketMap;
use crate::utils::ClusterError;

/// Where a key goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Index into the topology's node list
    pub node: usize,
    /// vBucket to put in the request header; `None` for ketama buckets
    pub vbucket: Option<u16>,
}

/// Locator-specific key mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMapper {
    VBucket(VBucketMap),
    Ketama(Continuum),
}

impl KeyMapper {
    pub fn from_map(map: &ClusterMap) -> Result<Self, ClusterError> {
        if map.nodes.is_empty() {
            return Err(ClusterError::NoNodes);
        }
        match map.locator {
            Locator::VBucket => {
                let table = map
                    .vbuckets
                    .as_ref()
                    .filter(|t| !t.entries.is_empty())
                    .ok_or_else(|| ClusterError::UnsupportedLocator("vbucket without a table".into()))?;
                Ok(KeyMapper::VBucket(VBucketMap::from_table(table)))
            }
            Locator::Ketama => Ok(KeyMapper::Ketama(Continuum::new(&map.nodes))),
        }
    }

    pub fn locator(&self) -> Locator {
        match self {
            KeyMapper::VBucket(_) => Locator::VBucket,
            KeyMapper::Ketama(_) => Locator::Ketama,
        }
    }

    /// Primary route for a key
    pub fn map_key(&self, key: &[u8]) -> Result<Route, ClusterError> {
        match self {
            KeyMapper::VBucket(map) => {
                let vbucket = map.vbucket_for_key(key);
                Ok(Route {
                    node: map.primary(vbucket)?,
                    vbucket: Some(vbucket),
                })
            }
            KeyMapper::Ketama(ring) => ring
                .locate(key)
                .map(|node| Route {
                    node,
                    vbucket: None,
                })
                .ok_or(ClusterError::NoNodes),
        }
    }

    /// Route to replica `n` (1-based); ketama buckets have no replicas
    pub fn map_replica(&self, key: &[u8], n: usize) -> Result<Route, ClusterError> {
        match self {
            KeyMapper::VBucket(map) => {
                let vbucket = map.vbucket_for_key(key);
                Ok(Route {
                    node: map.replica(vbucket, n)?,
                    vbucket: Some(vbucket),
                })
            }
            KeyMapper::Ketama(_) => Err(ClusterError::NoReplica {
                vbucket: 0,
                replica: n,
            }),
        }
    }

    pub fn num_replicas(&self) -> usize {
        match self {
            KeyMapper::VBucket(map) => map.num_replicas(),
            KeyMapper::Ketama(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config_map::{NodeAddress, VBucketTable};

    fn vbucket_map(entries: Vec<Vec<i16>>) -> ClusterMap {
        ClusterMap {
            revision: 1,
            bucket: "default".into(),
            locator: Locator::VBucket,
            nodes: vec![NodeAddress::new("a", 11210), NodeAddress::new("b", 11210)],
            vbuckets: Some(VBucketTable {
                num_replicas: 1,
                entries,
            }),
        }
    }

    #[test]
    fn test_vbucket_routing() {
        let map = vbucket_map(vec![vec![0, 1], vec![0, 1], vec![1, 0], vec![1, 0]]);
        let mapper = KeyMapper::from_map(&map).unwrap();
        let route = mapper.map_key(b"foo").unwrap();
        let vb = route.vbucket.unwrap();
        assert_eq!(route.node, if vb < 2 { 0 } else { 1 });
        assert_eq!(mapper.map_replica(b"foo", 1).unwrap().node, 1 - route.node);
        assert_eq!(mapper.num_replicas(), 1);
    }

    #[test]
    fn test_ketama_routing_has_no_vbucket() {
        let map = ClusterMap::static_ketama(
            "cache",
            vec![NodeAddress::new("a", 11211), NodeAddress::new("b", 11211)],
        );
        let mapper = KeyMapper::from_map(&map).unwrap();
        let route = mapper.map_key(b"foo").unwrap();
        assert!(route.vbucket.is_none());
        assert!(route.node < 2);
        assert!(mapper.map_replica(b"foo", 1).is_err());
    }

    #[test]
    fn test_empty_maps_rejected() {
        let mut map = vbucket_map(vec![]);
        assert!(KeyMapper::from_map(&map).is_err());
        map.nodes.clear();
        assert!(matches!(KeyMapper::from_map(&map), Err(ClusterError::NoNodes)));
    }

    #[test]
    fn test_equal_layouts_compare_equal() {
        let a = KeyMapper::from_map(&vbucket_map(vec![vec![0, 1]; 8])).unwrap();
        let b = KeyMapper::from_map(&vbucket_map(vec![vec![0, 1]; 8])).unwrap();
        let c = KeyMapper::from_map(&vbucket_map(vec![vec![1, 0]; 8])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
