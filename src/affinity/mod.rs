//! Spatial affinity
//!
//! Maps tile addresses to a fixed number of partitions ("divisions") and
//! assigns cluster nodes to those divisions. The same function places data
//! at ingest and routes queries, so it must be a pure function of the tile
//! coordinates and the partition count.
//!
//! Tiles are grouped into square affinity blocks before hashing, so
//! neighbouring tiles usually share a division.
//!
//! ```text
//!   block = (x >> 2, y >> 2)
//!   division = (block.x + block.y × 7919) mod partition_count
//! ```

pub mod error;

pub use error::{AffinityError, AffinityResult};

use crate::storage::TileAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

/// Node attribute naming the division a node serves
pub const DIVISION_ATTRIBUTE: &str = "division";

/// Tiles per affinity block side, as a power of two
pub const AFFINITY_BLOCK_BITS: u32 = 2;

const ROW_STRIDE: u64 = 7919;

/// Division index for a tile. Identical inputs always give the identical
/// division, whichever node or thread asks.
pub fn division_of(tile_x: u32, tile_y: u32, partition_count: u32) -> u32 {
    let bx = (tile_x >> AFFINITY_BLOCK_BITS) as u64;
    let by = (tile_y >> AFFINITY_BLOCK_BITS) as u64;
    ((bx + by * ROW_STRIDE) % partition_count.max(1) as u64) as u32
}

/// What a cluster node does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Holds segments and executes partition requests
    Storage,
    /// Coordinates queries; holds no data
    Query,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Storage => write!(f, "storage"),
            NodeRole::Query => write!(f, "query"),
        }
    }
}

/// A node in the current cluster topology snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: Uuid,
    pub role: NodeRole,
    pub attributes: HashMap<String, String>,
}

impl ClusterNode {
    pub fn new(role: NodeRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            attributes: HashMap::new(),
        }
    }

    /// Builder method: advertise the division this node serves
    pub fn with_division(mut self, division: u32) -> Self {
        self.attributes
            .insert(DIVISION_ATTRIBUTE.to_string(), division.to_string());
        self
    }

    /// Advertised division, if present and numeric
    pub fn division(&self) -> Option<u32> {
        self.attributes.get(DIVISION_ATTRIBUTE)?.parse().ok()
    }
}

/// Division → ordered node list; the first node is primary, the rest backups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    divisions: Vec<Vec<Uuid>>,
}

impl PartitionMap {
    pub fn partition_count(&self) -> u32 {
        self.divisions.len() as u32
    }

    pub fn nodes_for(&self, division: u32) -> &[Uuid] {
        self.divisions
            .get(division as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary(&self, division: u32) -> Option<Uuid> {
        self.nodes_for(division).first().copied()
    }

    pub fn backups(&self, division: u32) -> &[Uuid] {
        self.nodes_for(division).get(1..).unwrap_or(&[])
    }

    /// First node for `division` accepted by `available`: the primary,
    /// failing over to backups in order
    pub fn route(&self, division: u32, available: impl Fn(&Uuid) -> bool) -> Option<Uuid> {
        self.nodes_for(division).iter().copied().find(|id| available(id))
    }

    /// Divisions with no eligible node
    pub fn uncovered(&self) -> Vec<u32> {
        self.divisions
            .iter()
            .enumerate()
            .filter(|(_, nodes)| nodes.is_empty())
            .map(|(division, _)| division as u32)
            .collect()
    }
}

/// Partitioning of the tile space across a fixed number of divisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialAffinity {
    partition_count: u32,
    role: NodeRole,
}

impl SpatialAffinity {
    /// Affinity over `partition_count` divisions served by storage nodes
    pub fn new(partition_count: u32) -> AffinityResult<Self> {
        Self::for_role(partition_count, NodeRole::Storage)
    }

    pub fn for_role(partition_count: u32, role: NodeRole) -> AffinityResult<Self> {
        if partition_count == 0 {
            return Err(AffinityError::InvalidPartitionCount(partition_count));
        }
        Ok(Self {
            partition_count,
            role,
        })
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn division_of(&self, tile: TileAddress) -> u32 {
        division_of(tile.x, tile.y, self.partition_count)
    }

    /// Assign nodes to divisions, preserving topology order within each
    /// division. Divisions nobody serves map to an empty list.
    pub fn assign_partitions(&self, nodes: &[ClusterNode]) -> PartitionMap {
        let mut divisions = vec![Vec::new(); self.partition_count as usize];
        for node in nodes.iter().filter(|n| n.role == self.role) {
            match node.division() {
                Some(division) if division < self.partition_count => {
                    divisions[division as usize].push(node.id);
                }
                _ => warn!(
                    node = %node.id,
                    attribute = ?node.attributes.get(DIVISION_ATTRIBUTE),
                    "Node advertises no usable division"
                ),
            }
        }

        let map = PartitionMap { divisions };
        let uncovered = map.uncovered();
        if !uncovered.is_empty() {
            warn!(
                role = %self.role,
                partitions = self.partition_count,
                uncovered = uncovered.len(),
                "Partial partition map: some divisions have no eligible node"
            );
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_partitions_rejected() {
        assert_eq!(
            SpatialAffinity::new(0).unwrap_err(),
            AffinityError::InvalidPartitionCount(0)
        );
    }

    #[test]
    fn test_eight_partitions_five_nodes() {
        let affinity = SpatialAffinity::new(8).unwrap();
        let nodes: Vec<ClusterNode> = (0..5)
            .map(|d| ClusterNode::new(NodeRole::Storage).with_division(d))
            .collect();

        let map = affinity.assign_partitions(&nodes);
        assert_eq!(map.partition_count(), 8);
        assert_eq!(map.uncovered(), vec![5, 6, 7]);
        for (division, node) in nodes.iter().enumerate() {
            assert_eq!(map.nodes_for(division as u32), &[node.id]);
        }
    }

    #[test]
    fn test_backups_keep_topology_order() {
        let affinity = SpatialAffinity::new(2).unwrap();
        let first = ClusterNode::new(NodeRole::Storage).with_division(1);
        let query = ClusterNode::new(NodeRole::Query).with_division(1);
        let second = ClusterNode::new(NodeRole::Storage).with_division(1);
        let unlabelled = ClusterNode::new(NodeRole::Storage);

        let map = affinity.assign_partitions(&[first.clone(), query, second.clone(), unlabelled]);
        assert_eq!(map.primary(1), Some(first.id));
        assert_eq!(map.backups(1), &[second.id]);
        assert!(map.nodes_for(0).is_empty());
        assert!(map.nodes_for(99).is_empty());

        assert_eq!(map.route(1, |id| *id != first.id), Some(second.id));
        assert_eq!(map.route(1, |_| false), None);
    }

    #[test]
    fn test_neighbouring_tiles_share_a_block() {
        let affinity = SpatialAffinity::new(1024).unwrap();
        let d = affinity.division_of(TileAddress::new(400, 800));
        assert_eq!(affinity.division_of(TileAddress::new(403, 803)), d);
        assert_eq!(division_of(u32::MAX, u32::MAX, 1024), division_of(u32::MAX, u32::MAX, 1024));
    }

    #[test]
    fn test_division_is_thread_independent() {
        let expected: Vec<u32> = (0..500u32).map(|i| division_of(i * 37, i * 11, 97)).collect();
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..500u32).map(|i| division_of(i * 37, i * 11, 97)).collect::<Vec<u32>>()))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }

    proptest! {
        #[test]
        fn prop_division_in_range(x in any::<u32>(), y in any::<u32>(), n in 1u32..5_000) {
            let division = division_of(x, y, n);
            prop_assert!(division < n);
            prop_assert_eq!(division, division_of(x, y, n));
        }
    }
}
