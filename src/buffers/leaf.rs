//! Client leaf subgrids
//!
//! A client leaf holds one query-time value per cell of a tile for a single
//! measurement type. The set of leaf kinds is closed, so dispatch over the
//! measurement type is an enum match rather than a runtime type lookup.

use crate::storage::{Pass, TileAddress, NULL_CMV, NULL_TARGET_CMV, NULL_TARGET_PASS_COUNT, NULL_TEMPERATURE};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of value a query extracts per cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementType {
    Height,
    PassCount,
    Cmv,
    Temperature,
}

impl MeasurementType {
    pub const ALL: [MeasurementType; 4] = [
        MeasurementType::Height,
        MeasurementType::PassCount,
        MeasurementType::Cmv,
        MeasurementType::Temperature,
    ];

    /// Dense slot for per-type tables
    pub fn slot(self) -> usize {
        match self {
            MeasurementType::Height => 0,
            MeasurementType::PassCount => 1,
            MeasurementType::Cmv => 2,
            MeasurementType::Temperature => 3,
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeasurementType::Height => "height",
            MeasurementType::PassCount => "pass_count",
            MeasurementType::Cmv => "cmv",
            MeasurementType::Temperature => "temperature",
        };
        f.write_str(name)
    }
}

/// Latest elevation in a cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeightCell {
    pub height: f32,
    pub time: i64,
}

/// Pass count in a cell with the target in force at the latest pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassCountCell {
    pub count: u32,
    pub target: u16,
}

/// Latest compaction value in a cell with its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmvCell {
    pub cmv: i16,
    pub target: i16,
}

/// Latest material temperature in a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureCell {
    pub temperature: u16,
}

/// One value slot per cell of a tile
#[derive(Debug, Clone, PartialEq)]
pub struct LeafGrid<T> {
    cells: Vec<Option<T>>,
    populated: usize,
}

impl<T: Copy> LeafGrid<T> {
    pub fn new(cells_per_tile: usize) -> Self {
        Self {
            cells: vec![None; cells_per_tile],
            populated: 0,
        }
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.cells.get(index).copied().flatten()
    }

    pub fn set(&mut self, index: usize, value: T) {
        if let Some(slot) = self.cells.get_mut(index) {
            if slot.is_none() {
                self.populated += 1;
            }
            *slot = Some(value);
        }
    }

    /// Populated cells with their indices
    pub fn iter(&self) -> impl Iterator<Item = (usize, T)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(index, cell)| cell.map(|value| (index, value)))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    pub fn populated(&self) -> usize {
        self.populated
    }

    fn clear(&mut self) {
        if self.populated > 0 {
            self.cells.iter_mut().for_each(|cell| *cell = None);
            self.populated = 0;
        }
    }
}

/// Typed query-result container for one tile
#[derive(Debug, Clone, PartialEq)]
pub enum ClientLeaf {
    Height(Leaf<HeightCell>),
    PassCount(Leaf<PassCountCell>),
    Cmv(Leaf<CmvCell>),
    Temperature(Leaf<TemperatureCell>),
}

/// A grid plus the ownership marker naming the tile it was filled for
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf<T> {
    pub origin: Option<TileAddress>,
    pub grid: LeafGrid<T>,
}

impl<T: Copy> Leaf<T> {
    pub fn new(cells_per_tile: usize) -> Self {
        Self {
            origin: None,
            grid: LeafGrid::new(cells_per_tile),
        }
    }
}

macro_rules! each_leaf {
    ($leaf:expr, $inner:ident => $body:expr) => {
        match $leaf {
            ClientLeaf::Height($inner) => $body,
            ClientLeaf::PassCount($inner) => $body,
            ClientLeaf::Cmv($inner) => $body,
            ClientLeaf::Temperature($inner) => $body,
        }
    };
}

impl ClientLeaf {
    pub fn height(cells_per_tile: usize) -> Self {
        ClientLeaf::Height(Leaf::new(cells_per_tile))
    }

    pub fn pass_count(cells_per_tile: usize) -> Self {
        ClientLeaf::PassCount(Leaf::new(cells_per_tile))
    }

    pub fn cmv(cells_per_tile: usize) -> Self {
        ClientLeaf::Cmv(Leaf::new(cells_per_tile))
    }

    pub fn temperature(cells_per_tile: usize) -> Self {
        ClientLeaf::Temperature(Leaf::new(cells_per_tile))
    }

    pub fn measurement_type(&self) -> MeasurementType {
        match self {
            ClientLeaf::Height(_) => MeasurementType::Height,
            ClientLeaf::PassCount(_) => MeasurementType::PassCount,
            ClientLeaf::Cmv(_) => MeasurementType::Cmv,
            ClientLeaf::Temperature(_) => MeasurementType::Temperature,
        }
    }

    pub fn origin(&self) -> Option<TileAddress> {
        each_leaf!(self, leaf => leaf.origin)
    }

    pub fn set_origin(&mut self, origin: TileAddress) {
        each_leaf!(self, leaf => leaf.origin = Some(origin))
    }

    pub fn populated(&self) -> usize {
        each_leaf!(self, leaf => leaf.grid.populated())
    }

    pub fn is_empty(&self) -> bool {
        self.populated() == 0
    }

    /// Drop every cell value and the ownership marker
    pub fn clear(&mut self) {
        each_leaf!(self, leaf => {
            leaf.origin = None;
            leaf.grid.clear();
        })
    }

    /// Derive this leaf's value for one cell from its filtered passes, which
    /// must arrive in time order. Cells with no qualifying pass stay empty.
    pub fn assign<'a>(&mut self, cell_index: usize, passes: impl IntoIterator<Item = &'a Pass>) {
        match self {
            ClientLeaf::Height(leaf) => {
                if let Some(pass) = passes.into_iter().filter(|p| p.has_height()).last() {
                    leaf.grid.set(cell_index, HeightCell { height: pass.height, time: pass.time });
                }
            }
            ClientLeaf::PassCount(leaf) => {
                let mut full = 0u32;
                let mut half = 0u32;
                let mut target = NULL_TARGET_PASS_COUNT;
                for pass in passes {
                    if pass.half_pass {
                        half += 1;
                    } else {
                        full += 1;
                    }
                    target = pass.events.target_pass_count;
                }
                let count = full + half / 2;
                if count > 0 {
                    leaf.grid.set(cell_index, PassCountCell { count, target });
                }
            }
            ClientLeaf::Cmv(leaf) => {
                if let Some(pass) = passes.into_iter().filter(|p| p.cmv != NULL_CMV).last() {
                    let target = pass.events.target_cmv;
                    leaf.grid.set(cell_index, CmvCell { cmv: pass.cmv, target });
                }
            }
            ClientLeaf::Temperature(leaf) => {
                if let Some(pass) = passes
                    .into_iter()
                    .filter(|p| p.temperature != NULL_TEMPERATURE)
                    .last()
                {
                    leaf.grid.set(cell_index, TemperatureCell { temperature: pass.temperature });
                }
            }
        }
    }
}

/// Whether a compaction target is meaningful
pub fn has_cmv_target(target: i16) -> bool {
    target != NULL_TARGET_CMV
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PassEvents, NULL_HEIGHT};

    #[test]
    fn test_height_takes_latest_elevation() {
        let mut leaf = ClientLeaf::height(16);
        let passes = [
            Pass::new(1, 10.0),
            Pass::new(2, 11.0),
            Pass::new(3, NULL_HEIGHT),
        ];
        leaf.assign(4, &passes);

        let ClientLeaf::Height(inner) = &leaf else { panic!("wrong leaf kind") };
        assert_eq!(inner.grid.get(4), Some(HeightCell { height: 11.0, time: 2 }));
        assert_eq!(inner.grid.get(5), None);
        assert_eq!(leaf.populated(), 1);
    }

    #[test]
    fn test_pass_count_halves_half_passes() {
        let mut leaf = ClientLeaf::pass_count(16);
        let events = PassEvents {
            target_pass_count: 6,
            ..PassEvents::default()
        };
        let mut half = Pass::new(3, 1.0).events(events);
        half.half_pass = true;
        let passes = [Pass::new(1, 1.0), Pass::new(2, 1.0), half, half];
        leaf.assign(0, &passes);

        let ClientLeaf::PassCount(inner) = &leaf else { panic!("wrong leaf kind") };
        assert_eq!(inner.grid.get(0), Some(PassCountCell { count: 3, target: 6 }));
    }

    #[test]
    fn test_empty_input_leaves_cell_unset() {
        let mut leaf = ClientLeaf::cmv(16);
        leaf.assign(2, &[Pass::new(1, 1.0)]);
        assert!(leaf.is_empty());
    }

    #[test]
    fn test_clear_resets_origin_and_cells() {
        let mut leaf = ClientLeaf::temperature(16);
        leaf.set_origin(TileAddress::new(1, 2));
        leaf.assign(1, &[Pass::new(1, 1.0).temperature(850)]);
        assert_eq!(leaf.origin(), Some(TileAddress::new(1, 2)));

        leaf.clear();
        assert_eq!(leaf.origin(), None);
        assert!(leaf.is_empty());
        assert_eq!(leaf.measurement_type(), MeasurementType::Temperature);
    }
}
