//! In-process cluster
//!
//! Stands in for a real deployment: every division is served by one or more
//! [`ComputeNode`]s living in this process, each with its own segment store.
//! Ingestion routes a pass to every live node of its tile's division and
//! records the tile in the site-wide existence map used to prune queries.
//!
//! ```text
//!   append(tile, cell, pass)
//!        │ division_of(tile)
//!        ▼
//!   partition map ──► [primary, backup…] ──► node.store.append()
//!        │
//!        └──► site existence map
//! ```

pub mod error;
pub mod node;

pub use error::{ClusterError, ClusterResult};
pub use node::ComputeNode;

use crate::affinity::{ClusterNode, NodeRole, PartitionMap, SpatialAffinity};
use crate::buffers::ClientLeafFactory;
use crate::pipeline::PartitionExecutor;
use crate::storage::{
    CellCoord, ExistenceMap, FlushStats, IndexGeometry, MemoryTier, Pass, SegmentStore,
    StoreConfig, TileAddress,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Shape of an in-process cluster
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub partition_count: u32,
    /// Nodes per division; the first is primary
    pub replicas: u32,
    /// Role the nodes advertise; partitions are assigned by it
    pub role: NodeRole,
    pub store: StoreConfig,
    pub worker_threads: usize,
    pub max_pooled_leaves_per_type: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            replicas: 1,
            role: NodeRole::Storage,
            store: StoreConfig::default(),
            worker_threads: 4,
            max_pooled_leaves_per_type: 64,
        }
    }
}

/// Nodes, routing and the site existence map
pub struct Cluster {
    affinity: SpatialAffinity,
    geometry: IndexGeometry,
    nodes: RwLock<Vec<Arc<ComputeNode>>>,
    executors: RwLock<HashMap<Uuid, Arc<dyn PartitionExecutor>>>,
    partition_map: RwLock<PartitionMap>,
    existence: RwLock<ExistenceMap>,
    down: RwLock<HashSet<Uuid>>,
}

impl Cluster {
    /// Memory-backed cluster with `replicas` nodes per division
    pub fn new(config: ClusterConfig) -> ClusterResult<Self> {
        let affinity = SpatialAffinity::for_role(config.partition_count, config.role)?;
        let cells_per_tile = config.store.geometry.cells_per_tile();
        let mut nodes = Vec::new();
        for _ in 0..config.replicas.max(1) {
            for division in 0..config.partition_count {
                let factory = Arc::new(ClientLeafFactory::with_defaults(
                    cells_per_tile,
                    config.max_pooled_leaves_per_type,
                ));
                nodes.push(ComputeNode::new(
                    ClusterNode::new(config.role).with_division(division),
                    SegmentStore::new(config.store.clone(), Arc::new(MemoryTier::new())),
                    factory,
                    config.worker_threads,
                ));
            }
        }
        Ok(Self::from_nodes(affinity, nodes))
    }

    /// Cluster over explicitly built nodes, in topology order
    pub fn from_nodes(affinity: SpatialAffinity, nodes: Vec<ComputeNode>) -> Self {
        let geometry = nodes
            .first()
            .map(|n| n.store().geometry())
            .unwrap_or_default();
        let nodes: Vec<Arc<ComputeNode>> = nodes.into_iter().map(Arc::new).collect();

        let mut existence = ExistenceMap::new();
        for node in &nodes {
            existence.union_with(&node.store().existence());
        }

        let executors = nodes
            .iter()
            .map(|node| {
                let executor: Arc<dyn PartitionExecutor> = Arc::new(Arc::clone(node));
                (node.id(), executor)
            })
            .collect();
        let topology: Vec<ClusterNode> = nodes.iter().map(|n| n.topology().clone()).collect();
        let partition_map = affinity.assign_partitions(&topology);
        info!(
            nodes = nodes.len(),
            partitions = affinity.partition_count(),
            tiles = existence.count(),
            "Cluster ready"
        );

        Self {
            affinity,
            geometry,
            nodes: RwLock::new(nodes),
            executors: RwLock::new(executors),
            partition_map: RwLock::new(partition_map),
            existence: RwLock::new(existence),
            down: RwLock::new(HashSet::new()),
        }
    }

    pub fn affinity(&self) -> &SpatialAffinity {
        &self.affinity
    }

    pub fn geometry(&self) -> IndexGeometry {
        self.geometry
    }

    pub fn nodes(&self) -> Vec<Arc<ComputeNode>> {
        self.nodes.read().clone()
    }

    pub fn node(&self, id: Uuid) -> Option<Arc<ComputeNode>> {
        self.nodes.read().iter().find(|n| n.id() == id).cloned()
    }

    /// Snapshot of the current partition map
    pub fn partition_map(&self) -> PartitionMap {
        self.partition_map.read().clone()
    }

    /// Snapshot of the site existence map
    pub fn existence(&self) -> ExistenceMap {
        self.existence.read().clone()
    }

    pub fn executors(&self) -> HashMap<Uuid, Arc<dyn PartitionExecutor>> {
        self.executors.read().clone()
    }

    /// Swap the executor serving a node
    pub fn replace_executor(&self, id: Uuid, executor: Arc<dyn PartitionExecutor>) -> ClusterResult<()> {
        let mut executors = self.executors.write();
        let slot = executors.get_mut(&id).ok_or(ClusterError::UnknownNode(id))?;
        *slot = executor;
        Ok(())
    }

    pub fn is_available(&self, id: &Uuid) -> bool {
        !self.down.read().contains(id)
    }

    /// Take a node out of routing without changing the topology
    pub fn mark_down(&self, id: Uuid) -> ClusterResult<()> {
        self.node(id).ok_or(ClusterError::UnknownNode(id))?;
        self.down.write().insert(id);
        warn!(node = %id, "Node marked down");
        Ok(())
    }

    pub fn mark_up(&self, id: Uuid) -> bool {
        self.down.write().remove(&id)
    }

    /// Drop a node from the topology and reassign partitions
    pub fn remove_node(&self, id: Uuid) -> ClusterResult<()> {
        let mut nodes = self.nodes.write();
        let position = nodes
            .iter()
            .position(|n| n.id() == id)
            .ok_or(ClusterError::UnknownNode(id))?;
        nodes.remove(position);
        self.executors.write().remove(&id);
        self.down.write().remove(&id);

        let topology: Vec<ClusterNode> = nodes.iter().map(|n| n.topology().clone()).collect();
        *self.partition_map.write() = self.affinity.assign_partitions(&topology);
        info!(node = %id, remaining = nodes.len(), "Node removed");
        Ok(())
    }

    /// Store a pass on every live node serving the tile's division
    pub fn append(&self, tile: TileAddress, cell: CellCoord, pass: Pass) -> ClusterResult<()> {
        let division = self.affinity.division_of(tile);
        let candidates = self.partition_map.read().nodes_for(division).to_vec();
        let targets: Vec<Arc<ComputeNode>> = candidates
            .into_iter()
            .filter(|id| self.is_available(id))
            .filter_map(|id| self.node(id))
            .collect();
        if targets.is_empty() {
            return Err(ClusterError::NoEligibleNode { division });
        }

        for node in &targets {
            node.store().append(tile, cell, pass)?;
        }
        // Fast path: the bit is usually set already
        let known = self.existence.read().contains(tile);
        if !known {
            self.existence.write().set(tile);
        }
        Ok(())
    }

    /// Flush every node's store, summing the results
    pub fn flush(&self) -> ClusterResult<FlushStats> {
        let mut total = FlushStats::default();
        for node in self.nodes() {
            let stats = node.store().flush()?;
            total.segments_written += stats.segments_written;
            total.segments_removed += stats.segments_removed;
            total.directories_written += stats.directories_written;
            total.bytes_written += stats.bytes_written;
        }
        Ok(total)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("affinity", &self.affinity)
            .field("nodes", &self.nodes.read().len())
            .field("tiles", &self.existence.read().count())
            .field("down", &self.down.read().len())
            .finish()
    }
}
