//! Ketama consistent hashing for memcached-style buckets
//!
//! Every node contributes 160 points to a ring: for `i` in `0..40`, the MD5
//! of `"host:port-i"` yields four little-endian `u32` points. A key maps to
//! the first point at or after the first four bytes of `MD5(key)`, wrapping
//! to the start of the ring.

use md5::{Digest, Md5};

use super::config_map::NodeAddress;

const HASHES_PER_NODE: usize = 40;
const POINTS_PER_HASH: usize = 4;

/// Sorted hash ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuum {
    points: Vec<(u32, usize)>,
}

fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Ring position of a key
pub fn key_hash(key: &[u8]) -> u32 {
    let d = md5(key);
    u32::from_le_bytes([d[0], d[1], d[2], d[3]])
}

impl Continuum {
    pub fn new(nodes: &[NodeAddress]) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * HASHES_PER_NODE * POINTS_PER_HASH);
        for (index, node) in nodes.iter().enumerate() {
            let endpoint = node.endpoint();
            for i in 0..HASHES_PER_NODE {
                let d = md5(format!("{}-{}", endpoint, i).as_bytes());
                for chunk in d.chunks_exact(4) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((point, index));
                }
            }
        }
        // ties broken by node index
        points.sort_unstable();
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Node index owning `key`; `None` on an empty ring
    pub fn locate(&self, key: &[u8]) -> Option<usize> {
        self.locate_hash(key_hash(key))
    }

    pub fn locate_hash(&self, hash: u32) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|&(p, _)| p < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(self.points[idx].1)
    }
}
