//! vBucket key mapping
//!
//! A key's vBucket is `((crc32(key) >> 16) & 0x7fff) % num_vbuckets`; the
//! vBucket table then names the primary and replica nodes.

use super::config_map::VBucketTable;
use crate::utils::ClusterError;

/// vBucket for a key
#[inline]
pub fn vbucket_for_key(key: &[u8], num_vbuckets: usize) -> u16 {
    debug_assert!(num_vbuckets > 0);
    let crc = crc32fast::hash(key);
    (((crc >> 16) & 0x7fff) as usize % num_vbuckets) as u16
}

/// vBucket to node assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VBucketMap {
    num_replicas: usize,
    entries: Vec<Vec<i16>>,
}

impl VBucketMap {
    pub fn new(entries: Vec<Vec<i16>>, num_replicas: usize) -> Self {
        Self {
            num_replicas,
            entries,
        }
    }

    pub fn from_table(table: &VBucketTable) -> Self {
        Self::new(table.entries.clone(), table.num_replicas)
    }

    pub fn num_vbuckets(&self) -> usize {
        self.entries.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn vbucket_for_key(&self, key: &[u8]) -> u16 {
        vbucket_for_key(key, self.entries.len())
    }

    /// Node index of the vBucket's primary
    pub fn primary(&self, vbucket: u16) -> Result<usize, ClusterError> {
        self.entries
            .get(vbucket as usize)
            .and_then(|e| e.first())
            .and_then(|&i| usize::try_from(i).ok())
            .ok_or(ClusterError::UnassignedVbucket(vbucket))
    }

    /// Node index of replica `n` (1-based)
    ///
    /// Asking for more replicas than the bucket keeps is `NoReplica`; a
    /// configured replica slot holding `-1` is `UnassignedVbucket`.
    pub fn replica(&self, vbucket: u16, n: usize) -> Result<usize, ClusterError> {
        if n == 0 || n > self.num_replicas {
            return Err(ClusterError::NoReplica {
                vbucket,
                replica: n,
            });
        }
        self.entries
            .get(vbucket as usize)
            .and_then(|e| e.get(n))
            .and_then(|&i| usize::try_from(i).ok())
            .ok_or(ClusterError::UnassignedVbucket(vbucket))
    }
}
