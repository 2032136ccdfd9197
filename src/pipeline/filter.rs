//! Query filters
//!
//! A query selects passes by where they are (spatial), when they were
//! recorded (time) and what the machine was doing (attribute).

use crate::storage::{
    CellAddress, GpsAccuracy, IndexGeometry, Pass, PassType, TileAddress, TimeRange, VibrationState,
};
use serde::{Deserialize, Serialize};

/// Cells a query covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpatialFilter {
    #[default]
    All,
    /// Inclusive rectangle in global cell coordinates
    CellRect { min: CellAddress, max: CellAddress },
}

impl SpatialFilter {
    pub fn rect(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        SpatialFilter::CellRect {
            min: CellAddress::new(x0.min(x1), y0.min(y1)),
            max: CellAddress::new(x0.max(x1), y0.max(y1)),
        }
    }

    /// Whether any cell of `tile` can match
    pub fn intersects_tile(&self, tile: TileAddress, geometry: IndexGeometry) -> bool {
        match self {
            SpatialFilter::All => true,
            SpatialFilter::CellRect { min, max } => {
                let bits = geometry.dimension_bits() as u32;
                let x0 = (tile.x as u64) << bits;
                let y0 = (tile.y as u64) << bits;
                let side = geometry.dimension() as u64;
                x0 <= max.x as u64
                    && x0 + side > min.x as u64
                    && y0 <= max.y as u64
                    && y0 + side > min.y as u64
            }
        }
    }

    pub fn contains(&self, cell: CellAddress) -> bool {
        match self {
            SpatialFilter::All => true,
            SpatialFilter::CellRect { min, max } => {
                (min.x..=max.x).contains(&cell.x) && (min.y..=max.y).contains(&cell.y)
            }
        }
    }
}

/// Time window a query covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFilter {
    pub range: TimeRange,
}

impl TimeFilter {
    pub fn all() -> Self {
        Self {
            range: TimeRange::all(),
        }
    }

    /// Window `[start, end)`; an empty window selects nothing
    pub fn between(start: i64, end: i64) -> Self {
        Self {
            range: TimeRange::try_new(start, end).unwrap_or(TimeRange { start, end: start }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.range.start >= self.range.end
    }
}

impl Default for TimeFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Per-pass attribute constraints; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeFilter {
    pub machines: Option<Vec<u16>>,
    pub pass_types: Option<Vec<PassType>>,
    pub vibration: Option<VibrationState>,
    /// Worst accepted positioning accuracy
    pub gps_accuracy: Option<GpsAccuracy>,
    pub layer_id: Option<u16>,
    pub design_id: Option<i32>,
    /// Inclusive elevation band in metres
    pub elevation: Option<(f32, f32)>,
}

impl AttributeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: restrict to these machines
    pub fn machines(mut self, machines: impl IntoIterator<Item = u16>) -> Self {
        self.machines = Some(machines.into_iter().collect());
        self
    }

    /// Builder method: restrict to these pass types
    pub fn pass_types(mut self, pass_types: impl IntoIterator<Item = PassType>) -> Self {
        self.pass_types = Some(pass_types.into_iter().collect());
        self
    }

    pub fn vibration(mut self, state: VibrationState) -> Self {
        self.vibration = Some(state);
        self
    }

    pub fn gps_accuracy(mut self, worst: GpsAccuracy) -> Self {
        self.gps_accuracy = Some(worst);
        self
    }

    pub fn layer(mut self, layer_id: u16) -> Self {
        self.layer_id = Some(layer_id);
        self
    }

    pub fn design(mut self, design_id: i32) -> Self {
        self.design_id = Some(design_id);
        self
    }

    pub fn elevation(mut self, low: f32, high: f32) -> Self {
        self.elevation = Some((low.min(high), low.max(high)));
        self
    }

    pub fn matches(&self, pass: &Pass) -> bool {
        if let Some(machines) = &self.machines {
            if !machines.contains(&pass.machine_id) {
                return false;
            }
        }
        if let Some(pass_types) = &self.pass_types {
            if !pass_types.contains(&pass.pass_type) {
                return false;
            }
        }
        if self.vibration.is_some_and(|v| v != pass.events.vibration) {
            return false;
        }
        if self.gps_accuracy.is_some_and(|worst| pass.events.gps_accuracy > worst) {
            return false;
        }
        if self.layer_id.is_some_and(|layer| layer != pass.events.layer_id) {
            return false;
        }
        if self.design_id.is_some_and(|design| design != pass.events.design_id) {
            return false;
        }
        if let Some((low, high)) = self.elevation {
            if !pass.has_height() || pass.height < low || pass.height > high {
                return false;
            }
        }
        true
    }
}

/// All three filters of a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub spatial: SpatialFilter,
    pub time: TimeFilter,
    pub attribute: AttributeFilter,
}

impl QueryFilter {
    pub fn new(spatial: SpatialFilter, time: TimeFilter, attribute: AttributeFilter) -> Self {
        Self {
            spatial,
            time,
            attribute,
        }
    }
}
