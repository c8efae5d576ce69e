//! Cluster map parsing
//!
//! The server hands out its bucket configuration as JSON (via
//! GetClusterConfig or inside a NotMyVbucket response). Only the parts the
//! key-value router needs are kept: revision, node list with service ports,
//! the locator and, for vbucket buckets, the vBucket table.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Deserialize;

use crate::utils::ProtocolError;

/// Default key-value port
pub const DEFAULT_KV_PORT: u16 = 11210;

/// Placeholder the server uses for "the host you fetched this from"
const HOST_PLACEHOLDER: &str = "$HOST";

/// Address of one cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub host: String,
    pub kv_port: u16,
    /// Other service ports by service name (mgmt, capi, n1ql, ...)
    pub services: BTreeMap<String, u16>,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, kv_port: u16) -> Self {
        Self {
            host: host.into(),
            kv_port,
            services: BTreeMap::new(),
        }
    }

    /// Identity used to match nodes across revisions
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.kv_port)
    }

    pub fn service_port(&self, service: &str) -> Option<u16> {
        self.services.get(service).copied()
    }

    fn same_endpoint(&self, other: &NodeAddress) -> bool {
        self.host == other.host && self.kv_port == other.kv_port
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.kv_port)
    }
}

/// How keys are distributed over nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    VBucket,
    Ketama,
}

/// vBucket table: for each vBucket, `[primary, replica1, ...]` node indices
/// into `ClusterMap::nodes`; `-1` means unassigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VBucketTable {
    pub num_replicas: usize,
    pub entries: Vec<Vec<i16>>,
}

/// Parsed cluster map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMap {
    pub revision: u64,
    pub bucket: String,
    pub locator: Locator,
    pub nodes: Vec<NodeAddress>,
    pub vbuckets: Option<VBucketTable>,
}

impl ClusterMap {
    /// Parse the bucket config JSON fetched from `source_host`
    pub fn parse(json: &str, source_host: &str) -> Result<Self, ProtocolError> {
        let json = json.replace(HOST_PLACEHOLDER, source_host);
        let raw: RawBucketConfig = serde_json::from_str(&json)
            .map_err(|e| ProtocolError::InvalidConfig(e.to_string()))?;
        raw.into_cluster_map(source_host)
    }

    pub fn parse_bytes(json: &[u8], source_host: &str) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(json)
            .map_err(|e| ProtocolError::InvalidConfig(format!("not UTF-8: {}", e)))?;
        Self::parse(text, source_host)
    }

    /// Static ketama map over the given addresses, for servers that cannot
    /// serve a cluster map themselves
    pub fn static_ketama(bucket: &str, nodes: Vec<NodeAddress>) -> Self {
        Self {
            revision: 0,
            bucket: bucket.to_string(),
            locator: Locator::Ketama,
            nodes,
            vbuckets: None,
        }
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbuckets.as_ref().map(|t| t.entries.len()).unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct RawBucketConfig {
    #[serde(default)]
    rev: u64,
    #[serde(default)]
    name: String,
    #[serde(rename = "nodeLocator", default)]
    node_locator: Option<String>,
    #[serde(rename = "nodesExt", default)]
    nodes_ext: Vec<RawNodeExt>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(rename = "vBucketServerMap", default)]
    vbucket_server_map: Option<RawVBucketServerMap>,
}

#[derive(Debug, Deserialize)]
struct RawNodeExt {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    hostname: String,
    #[serde(default)]
    ports: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawVBucketServerMap {
    #[serde(rename = "hashAlgorithm", default)]
    hash_algorithm: Option<String>,
    #[serde(rename = "numReplicas", default)]
    num_replicas: usize,
    #[serde(rename = "serverList", default)]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap", default)]
    vbucket_map: Vec<Vec<i16>>,
}

impl RawBucketConfig {
    fn into_cluster_map(self, source_host: &str) -> Result<ClusterMap, ProtocolError> {
        let locator = match self.node_locator.as_deref() {
            Some("ketama") => Locator::Ketama,
            Some("vbucket") => Locator::VBucket,
            None if self.vbucket_server_map.is_some() => Locator::VBucket,
            None => Locator::Ketama,
            Some(other) => {
                return Err(ProtocolError::InvalidConfig(format!(
                    "unknown nodeLocator '{}'",
                    other
                )))
            }
        };

        let extended = self.extended_nodes(source_host);

        let (nodes, vbuckets) = match locator {
            Locator::VBucket => {
                let map = self.vbucket_server_map.ok_or_else(|| {
                    ProtocolError::InvalidConfig("vbucket locator without vBucketServerMap".into())
                })?;
                if let Some(algo) = map.hash_algorithm.as_deref() {
                    if !algo.eq_ignore_ascii_case("crc") {
                        return Err(ProtocolError::InvalidConfig(format!(
                            "unsupported hashAlgorithm '{}'",
                            algo
                        )));
                    }
                }

                // serverList order is what vBucketMap indices refer to
                let mut nodes = Vec::with_capacity(map.server_list.len());
                for server in &map.server_list {
                    let mut addr = parse_host_port(server, DEFAULT_KV_PORT)?;
                    if let Some(ext) = extended.iter().find(|n| n.same_endpoint(&addr)) {
                        addr.services = ext.services.clone();
                    }
                    nodes.push(addr);
                }

                for (vb, entry) in map.vbucket_map.iter().enumerate() {
                    if entry.is_empty() {
                        return Err(ProtocolError::InvalidConfig(format!(
                            "vBucket {} has an empty entry",
                            vb
                        )));
                    }
                    if let Some(bad) = entry.iter().find(|&&i| i >= nodes.len() as i16 || i < -1) {
                        return Err(ProtocolError::InvalidConfig(format!(
                            "vBucket {} refers to node index {} of {}",
                            vb,
                            bad,
                            nodes.len()
                        )));
                    }
                }
                if map.vbucket_map.len() > u16::MAX as usize + 1 {
                    return Err(ProtocolError::InvalidConfig(format!(
                        "{} vBuckets exceed the protocol limit",
                        map.vbucket_map.len()
                    )));
                }

                let table = VBucketTable {
                    num_replicas: map.num_replicas,
                    entries: map.vbucket_map,
                };
                (nodes, Some(table))
            }
            Locator::Ketama => {
                let nodes = if extended.is_empty() {
                    self.nodes
                        .iter()
                        .map(|n| {
                            let host = parse_host_port(&n.hostname, 8091)?.host;
                            let port = n.ports.get("direct").copied().unwrap_or(DEFAULT_KV_PORT);
                            Ok(NodeAddress::new(host, port))
                        })
                        .collect::<Result<Vec<_>, ProtocolError>>()?
                } else {
                    extended
                };
                (nodes, None)
            }
        };

        Ok(ClusterMap {
            revision: self.rev,
            bucket: self.name,
            locator,
            nodes,
            vbuckets,
        })
    }

    /// Nodes from `nodesExt` that run the key-value service; an entry
    /// without `hostname` is the node the config came from
    fn extended_nodes(&self, source_host: &str) -> Vec<NodeAddress> {
        self.nodes_ext
            .iter()
            .filter_map(|n| {
                let kv = *n.services.get("kv")?;
                let host = n.hostname.clone().unwrap_or_else(|| source_host.to_string());
                let services = n
                    .services
                    .iter()
                    .filter(|(name, _)| name.as_str() != "kv")
                    .map(|(name, port)| (name.clone(), *port))
                    .collect();
                Some(NodeAddress {
                    host,
                    kv_port: kv,
                    services,
                })
            })
            .collect()
    }
}

/// Parse "host:port", "[v6]:port" or a bare host
pub fn parse_host_port(s: &str, default_port: u16) -> Result<NodeAddress, ProtocolError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ProtocolError::InvalidConfig("empty host".into()));
    }

    if let Some(rest) = s.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| ProtocolError::InvalidConfig(format!("bad IPv6 address '{}'", s)))?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ProtocolError::InvalidConfig(format!("bad port in '{}'", s)))?,
            None => default_port,
        };
        return Ok(NodeAddress::new(host, port));
    }

    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| ProtocolError::InvalidConfig(format!("bad port in '{}'", s)))?;
            Ok(NodeAddress::new(host, port))
        }
        _ => Ok(NodeAddress::new(s, default_port)),
    }
}
