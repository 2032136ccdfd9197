//! Fixed-depth spatial index
//!
//! A quad-tree style tree over the tile coordinate space. Every interior node
//! fans out to `dimension × dimension` children, consuming `dimension_bits`
//! bits of each tile coordinate per level; leaves hold [`Tile`]s.
//!
//! ```text
//! level 0            [root]
//!                   /  ...  \
//! level 1      [node]  ...  [node]
//!                |
//!   ...         ...
//! level L-1    [tile] [tile] ...        (leaves)
//! ```
//!
//! Nodes live in an arena owned by the index. Children are referenced by
//! arena slot and each node records its parent slot, so there are no
//! owning back-references.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tile::Tile;
use crate::storage::types::{IndexGeometry, TileAddress};
use std::sync::Arc;

const ROOT: usize = 0;

#[derive(Debug)]
enum NodeKind {
    Interior(Box<[Option<usize>]>),
    Leaf(Arc<Tile>),
}

#[derive(Debug)]
struct Node {
    parent: Option<usize>,
    kind: NodeKind,
}

/// Arena-backed spatial index
#[derive(Debug)]
pub struct SpatialIndex {
    geometry: IndexGeometry,
    nodes: Vec<Node>,
    leaves: Vec<usize>,
}

impl SpatialIndex {
    pub fn new(geometry: IndexGeometry) -> Self {
        let root = Node {
            parent: None,
            kind: NodeKind::Interior(Self::empty_children(geometry)),
        };
        Self {
            geometry,
            nodes: vec![root],
            leaves: Vec::new(),
        }
    }

    fn empty_children(geometry: IndexGeometry) -> Box<[Option<usize>]> {
        vec![None; geometry.cells_per_tile()].into_boxed_slice()
    }

    pub fn geometry(&self) -> IndexGeometry {
        self.geometry
    }

    /// Child slot selected by `address` at interior depth `depth`
    fn child_index(&self, address: TileAddress, depth: u8) -> usize {
        let bits = self.geometry.dimension_bits() as u32;
        let shift = (self.geometry.levels() - 2 - depth) as u32 * bits;
        let mask = (1u32 << bits) - 1;
        let cx = (address.x >> shift) & mask;
        let cy = (address.y >> shift) & mask;
        (cx as usize) * self.geometry.dimension() as usize + cy as usize
    }

    fn check_range(&self, address: TileAddress) -> StorageResult<()> {
        if self.geometry.contains(address) {
            Ok(())
        } else {
            Err(StorageError::AddressOutOfRange {
                address,
                limit: self.geometry.tiles_per_axis(),
            })
        }
    }

    /// Find the tile at `address`, if it has been constructed
    pub fn locate(&self, address: TileAddress) -> Option<Arc<Tile>> {
        if !self.geometry.contains(address) {
            return None;
        }
        let mut current = ROOT;
        for depth in 0..self.geometry.levels() - 1 {
            let NodeKind::Interior(children) = &self.nodes[current].kind else {
                return None;
            };
            current = children[self.child_index(address, depth)]?;
        }
        match &self.nodes[current].kind {
            NodeKind::Leaf(tile) => Some(Arc::clone(tile)),
            NodeKind::Interior(_) => None,
        }
    }

    /// Walk from the root to `address`, creating missing nodes when
    /// `create_if_absent` is set. Repeated calls for one address return the
    /// same tile instance.
    pub fn construct_path(
        &mut self,
        address: TileAddress,
        create_if_absent: bool,
    ) -> StorageResult<Option<Arc<Tile>>> {
        self.check_range(address)?;
        if !create_if_absent {
            return Ok(self.locate(address));
        }

        let leaf_depth = self.geometry.levels() - 1;
        let mut current = ROOT;
        for depth in 0..leaf_depth {
            let slot = self.child_index(address, depth);
            let existing = match &self.nodes[current].kind {
                NodeKind::Interior(children) => children[slot],
                NodeKind::Leaf(_) => {
                    return Err(StorageError::Corruption(format!(
                        "leaf found above leaf level on path to {}",
                        address
                    )))
                }
            };

            current = match existing {
                Some(child) => child,
                None => {
                    let kind = if depth + 1 == leaf_depth {
                        NodeKind::Leaf(Arc::new(Tile::new(address, self.geometry.cells_per_tile())))
                    } else {
                        NodeKind::Interior(Self::empty_children(self.geometry))
                    };
                    self.attach(current, slot, kind)
                }
            };
        }

        match &self.nodes[current].kind {
            NodeKind::Leaf(tile) => Ok(Some(Arc::clone(tile))),
            NodeKind::Interior(_) => Err(StorageError::Corruption(format!(
                "interior node at leaf level for {}",
                address
            ))),
        }
    }

    /// Install a pre-built tile (used when reloading from persistence)
    pub(crate) fn insert_tile(&mut self, tile: Tile) -> StorageResult<Arc<Tile>> {
        let address = tile.address();
        self.check_range(address)?;
        let leaf_depth = self.geometry.levels() - 1;
        let mut current = ROOT;
        let mut pending = Some(tile);

        for depth in 0..leaf_depth {
            let slot = self.child_index(address, depth);
            let existing = match &self.nodes[current].kind {
                NodeKind::Interior(children) => children[slot],
                NodeKind::Leaf(_) => {
                    return Err(StorageError::Corruption(format!(
                        "leaf found above leaf level on path to {}",
                        address
                    )))
                }
            };
            current = match existing {
                Some(child) if depth + 1 < leaf_depth => child,
                Some(child) => {
                    // Replace the existing leaf in place
                    if let Some(tile) = pending.take() {
                        self.nodes[child].kind = NodeKind::Leaf(Arc::new(tile));
                    }
                    child
                }
                None => {
                    let kind = match pending.take() {
                        Some(tile) if depth + 1 == leaf_depth => NodeKind::Leaf(Arc::new(tile)),
                        other => {
                            pending = other;
                            NodeKind::Interior(Self::empty_children(self.geometry))
                        }
                    };
                    self.attach(current, slot, kind)
                }
            };
        }

        match &self.nodes[current].kind {
            NodeKind::Leaf(tile) => Ok(Arc::clone(tile)),
            NodeKind::Interior(_) => Err(StorageError::Corruption(format!(
                "failed to install tile {}",
                address
            ))),
        }
    }

    fn attach(&mut self, parent: usize, slot: usize, kind: NodeKind) -> usize {
        let id = self.nodes.len();
        let is_leaf = matches!(kind, NodeKind::Leaf(_));
        self.nodes.push(Node {
            parent: Some(parent),
            kind,
        });
        if let NodeKind::Interior(children) = &mut self.nodes[parent].kind {
            children[slot] = Some(id);
        }
        if is_leaf {
            self.leaves.push(id);
        }
        id
    }

    /// Number of arena hops from the node holding `address` back to the root
    pub fn depth_of(&self, address: TileAddress) -> Option<usize> {
        let mut current = ROOT;
        for depth in 0..self.geometry.levels() - 1 {
            let NodeKind::Interior(children) = &self.nodes[current].kind else {
                return None;
            };
            current = children[self.child_index(address, depth)]?;
        }
        let mut hops = 0;
        while let Some(parent) = self.nodes[current].parent {
            current = parent;
            hops += 1;
        }
        Some(hops)
    }

    /// Every constructed tile, in construction order
    pub fn tiles(&self) -> impl Iterator<Item = &Arc<Tile>> + '_ {
        self.leaves.iter().filter_map(|&id| match &self.nodes[id].kind {
            NodeKind::Leaf(tile) => Some(tile),
            NodeKind::Interior(_) => None,
        })
    }

    pub fn tile_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_index() -> SpatialIndex {
        SpatialIndex::new(IndexGeometry::new(3, 2).unwrap())
    }

    #[test]
    fn test_construct_path_is_idempotent() {
        let mut index = small_index();
        let address = TileAddress::new(5, 9);

        let first = index.construct_path(address, true).unwrap().unwrap();
        let nodes = index.node_count();
        let second = index.construct_path(address, true).unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(index.node_count(), nodes);
        assert_eq!(first.address(), address);
    }

    #[test]
    fn test_locate_without_create() {
        let mut index = small_index();
        let address = TileAddress::new(1, 2);
        assert!(index.locate(address).is_none());
        assert!(index.construct_path(address, false).unwrap().is_none());

        index.construct_path(address, true).unwrap();
        assert!(index.locate(address).is_some());
        assert!(index.locate(TileAddress::new(2, 1)).is_none());
    }

    #[test]
    fn test_address_out_of_range() {
        let mut index = small_index();
        // 3 levels of 2 bits => 16 tiles per axis
        let err = index.construct_path(TileAddress::new(16, 0), true).unwrap_err();
        assert!(matches!(
            err,
            StorageError::AddressOutOfRange { limit: 16, .. }
        ));
        assert!(index.locate(TileAddress::new(0, 16)).is_none());
    }

    #[test]
    fn test_siblings_share_interior_nodes() {
        let mut index = small_index();
        index.construct_path(TileAddress::new(0, 0), true).unwrap();
        index.construct_path(TileAddress::new(0, 1), true).unwrap();
        // root + one interior + two leaves
        assert_eq!(index.node_count(), 4);
        assert_eq!(index.tile_count(), 2);
        assert_eq!(index.depth_of(TileAddress::new(0, 1)), Some(2));
    }

    #[test]
    fn test_insert_tile_replaces_leaf() {
        let mut index = small_index();
        let address = TileAddress::new(7, 7);
        let original = index.construct_path(address, true).unwrap().unwrap();

        let installed = index.insert_tile(Tile::new(address, 16)).unwrap();
        assert!(!Arc::ptr_eq(&original, &installed));
        assert!(Arc::ptr_eq(&index.locate(address).unwrap(), &installed));
        assert_eq!(index.tile_count(), 1);

        let fresh = index.insert_tile(Tile::new(TileAddress::new(15, 0), 16)).unwrap();
        assert_eq!(fresh.address(), TileAddress::new(15, 0));
        assert_eq!(index.tile_count(), 2);
    }

    #[test]
    fn test_default_geometry_paths() {
        let mut index = SpatialIndex::new(IndexGeometry::default());
        let far = TileAddress::new((1 << 25) - 1, 12_345);
        let tile = index.construct_path(far, true).unwrap().unwrap();
        assert_eq!(tile.address(), far);
        assert_eq!(index.depth_of(far), Some(5));
    }
}
