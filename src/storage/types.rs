//! Core data types for the measurement store
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `Pass`: one timestamped measurement event for a cell
//! - `PassEvents`: the machine-event snapshot captured with a pass
//! - `TileAddress` / `CellCoord` / `CellAddress`: spatial addressing
//! - `IndexGeometry`: the fixed shape of an index instance
//! - `TimeRange`: a half-open time interval
//!
//! Every nullable attribute has a reserved null-sentinel value, listed as the
//! `NULL_*` constants below.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Null elevation
pub const NULL_HEIGHT: f32 = f32::MIN;
/// Null compaction meter value
pub const NULL_CMV: i16 = i16::MAX;
/// Null machine drive power
pub const NULL_MDP: i16 = i16::MAX;
/// Null resonance meter value
pub const NULL_RMV: i16 = i16::MAX;
/// Null material temperature (tenths of a degree)
pub const NULL_TEMPERATURE: u16 = 4096;
/// Null machine speed (cm/s)
pub const NULL_MACHINE_SPEED: u16 = u16::MAX;
/// Null radio latency
pub const NULL_RADIO_LATENCY: u8 = u8::MAX;
/// Null vibration frequency
pub const NULL_FREQUENCY: u16 = u16::MAX;
/// Null vibration amplitude
pub const NULL_AMPLITUDE: u16 = u16::MAX;
/// Null internal machine index
pub const NULL_MACHINE_ID: u16 = u16::MAX;
/// Null design reference
pub const NULL_DESIGN_ID: i32 = -1;
/// Null layer reference
pub const NULL_LAYER_ID: u16 = u16::MAX;
/// Null GPS tolerance (mm)
pub const NULL_GPS_TOLERANCE: u16 = u16::MAX;
/// Null target compaction meter value
pub const NULL_TARGET_CMV: i16 = i16::MAX;
/// Null target pass count
pub const NULL_TARGET_PASS_COUNT: u16 = 0;

/// Largest accepted pass time magnitude (ms). Any two accepted times differ
/// by less than `i64::MAX`, so a segment's time span always encodes.
pub const PASS_TIME_LIMIT: i64 = i64::MAX / 2;

/// Which part of the machine produced the pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PassType {
    Front = 0,
    Rear = 1,
    Track = 2,
    Wheel = 3,
}

impl PassType {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => PassType::Rear,
            2 => PassType::Track,
            3 => PassType::Wheel,
            _ => PassType::Front,
        }
    }
}

/// Positioning technology reported by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GpsMode {
    Old = 0,
    Fixed = 1,
    Float = 2,
    Differential = 3,
    Autonomous = 4,
    Sbas = 5,
    NoGps = 15,
}

impl GpsMode {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => GpsMode::Old,
            1 => GpsMode::Fixed,
            2 => GpsMode::Float,
            3 => GpsMode::Differential,
            4 => GpsMode::Autonomous,
            5 => GpsMode::Sbas,
            _ => GpsMode::NoGps,
        }
    }
}

/// Vibratory drum state at time of capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VibrationState {
    Off = 0,
    On = 1,
    Invalid = 2,
}

impl VibrationState {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => VibrationState::Off,
            1 => VibrationState::On,
            _ => VibrationState::Invalid,
        }
    }
}

/// Machine automatics (auto-vibration / blade control) mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AutomaticsMode {
    Manual = 0,
    Automatics = 1,
    Unknown = 2,
}

impl AutomaticsMode {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => AutomaticsMode::Manual,
            1 => AutomaticsMode::Automatics,
            _ => AutomaticsMode::Unknown,
        }
    }
}

/// Positioning accuracy band. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GpsAccuracy {
    Fine = 0,
    Medium = 1,
    Coarse = 2,
    Unknown = 3,
}

impl GpsAccuracy {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => GpsAccuracy::Fine,
            1 => GpsAccuracy::Medium,
            2 => GpsAccuracy::Coarse,
            _ => GpsAccuracy::Unknown,
        }
    }
}

/// Machine-event snapshot in force when a pass was captured
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PassEvents {
    /// Active design reference
    pub design_id: i32,
    pub vibration: VibrationState,
    pub automatics: AutomaticsMode,
    pub gps_accuracy: GpsAccuracy,
    /// GPS tolerance in millimetres
    pub gps_tolerance: u16,
    pub layer_id: u16,
    pub target_cmv: i16,
    pub target_pass_count: u16,
}

impl Default for PassEvents {
    fn default() -> Self {
        Self {
            design_id: NULL_DESIGN_ID,
            vibration: VibrationState::Invalid,
            automatics: AutomaticsMode::Unknown,
            gps_accuracy: GpsAccuracy::Unknown,
            gps_tolerance: NULL_GPS_TOLERANCE,
            layer_id: NULL_LAYER_ID,
            target_cmv: NULL_TARGET_CMV,
            target_pass_count: NULL_TARGET_PASS_COUNT,
        }
    }
}

/// One measurement event for a cell
///
/// Immutable once appended. Every attribute other than `time` may hold its
/// null sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pass {
    /// Unix timestamp in milliseconds
    pub time: i64,
    /// Elevation in metres
    pub height: f32,
    pub machine_id: u16,
    pub pass_type: PassType,
    pub gps_mode: GpsMode,
    pub half_pass: bool,
    pub cmv: i16,
    pub mdp: i16,
    pub rmv: i16,
    /// Tenths of a degree Celsius
    pub temperature: u16,
    /// Centimetres per second
    pub machine_speed: u16,
    pub radio_latency: u8,
    pub frequency: u16,
    pub amplitude: u16,
    pub events: PassEvents,
}

impl Pass {
    /// Create a pass with every attribute other than time and height null
    pub fn new(time: i64, height: f32) -> Self {
        Self {
            time,
            height,
            machine_id: NULL_MACHINE_ID,
            pass_type: PassType::Front,
            gps_mode: GpsMode::NoGps,
            half_pass: false,
            cmv: NULL_CMV,
            mdp: NULL_MDP,
            rmv: NULL_RMV,
            temperature: NULL_TEMPERATURE,
            machine_speed: NULL_MACHINE_SPEED,
            radio_latency: NULL_RADIO_LATENCY,
            frequency: NULL_FREQUENCY,
            amplitude: NULL_AMPLITUDE,
            events: PassEvents::default(),
        }
    }

    /// Builder method: set the internal machine index
    pub fn machine(mut self, machine_id: u16) -> Self {
        self.machine_id = machine_id;
        self
    }

    /// Builder method: set the compaction meter value
    pub fn cmv(mut self, cmv: i16) -> Self {
        self.cmv = cmv;
        self
    }

    /// Builder method: set machine drive power
    pub fn mdp(mut self, mdp: i16) -> Self {
        self.mdp = mdp;
        self
    }

    /// Builder method: set the material temperature (tenths of a degree)
    pub fn temperature(mut self, temperature: u16) -> Self {
        self.temperature = temperature;
        self
    }

    /// Builder method: set the pass type
    pub fn pass_type(mut self, pass_type: PassType) -> Self {
        self.pass_type = pass_type;
        self
    }

    /// Builder method: set the positioning mode
    pub fn gps_mode(mut self, gps_mode: GpsMode) -> Self {
        self.gps_mode = gps_mode;
        self
    }

    /// Builder method: set the event snapshot
    pub fn events(mut self, events: PassEvents) -> Self {
        self.events = events;
        self
    }

    pub fn has_height(&self) -> bool {
        self.height != NULL_HEIGHT
    }

    /// Reject measurements that would corrupt a segment if stored
    pub fn validate(&self) -> Result<(), String> {
        if !(-PASS_TIME_LIMIT..=PASS_TIME_LIMIT).contains(&self.time) {
            return Err(format!("time {} outside ±{}", self.time, PASS_TIME_LIMIT));
        }
        if self.has_height() && !self.height.is_finite() {
            return Err(format!("height {} is not finite", self.height));
        }
        if self.temperature > NULL_TEMPERATURE {
            return Err(format!("temperature {} out of range", self.temperature));
        }
        Ok(())
    }
}

/// Address of a tile (index leaf) in tile coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileAddress {
    pub x: u32,
    pub y: u32,
}

impl TileAddress {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Stable key fragment used by the persistence tier
    pub fn key(&self) -> String {
        format!("{:08x}{:08x}", self.x, self.y)
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.x, self.y)
    }
}

/// Cell position within a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: u16,
    pub y: u16,
}

impl CellCoord {
    pub const fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

/// Cell position in the index's global (offset) cell coordinate space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellAddress {
    pub x: u32,
    pub y: u32,
}

impl CellAddress {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Fixed shape of an index instance: number of tree levels and the
/// number of address bits consumed per level (tiles are
/// `2^dimension_bits` cells on a side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGeometry {
    levels: u8,
    dimension_bits: u8,
}

impl IndexGeometry {
    /// Returns `None` unless `levels >= 2` and the cell space fits in 31 bits
    pub fn new(levels: u8, dimension_bits: u8) -> Option<Self> {
        let total = levels as u32 * dimension_bits as u32;
        if levels < 2 || dimension_bits == 0 || total > 31 {
            return None;
        }
        Some(Self {
            levels,
            dimension_bits,
        })
    }

    pub fn levels(&self) -> u8 {
        self.levels
    }

    pub fn dimension_bits(&self) -> u8 {
        self.dimension_bits
    }

    /// Cells per tile side
    pub fn dimension(&self) -> u16 {
        1 << self.dimension_bits
    }

    pub fn cells_per_tile(&self) -> usize {
        let d = self.dimension() as usize;
        d * d
    }

    /// Tiles per axis of the addressable space
    pub fn tiles_per_axis(&self) -> u32 {
        1u32 << ((self.levels as u32 - 1) * self.dimension_bits as u32)
    }

    pub fn contains(&self, address: TileAddress) -> bool {
        let limit = self.tiles_per_axis();
        address.x < limit && address.y < limit
    }

    /// Flat index of a cell within its tile, or `None` if outside
    pub fn cell_index(&self, cell: CellCoord) -> Option<usize> {
        let d = self.dimension();
        if cell.x >= d || cell.y >= d {
            return None;
        }
        Some(cell.x as usize * d as usize + cell.y as usize)
    }

    pub fn cell_at(&self, index: usize) -> CellCoord {
        let d = self.dimension() as usize;
        CellCoord::new((index / d) as u16, (index % d) as u16)
    }

    /// Split a global cell address into its tile and in-tile position
    pub fn locate_cell(&self, cell: CellAddress) -> (TileAddress, CellCoord) {
        let bits = self.dimension_bits as u32;
        let mask = (1u32 << bits) - 1;
        (
            TileAddress::new(cell.x >> bits, cell.y >> bits),
            CellCoord::new((cell.x & mask) as u16, (cell.y & mask) as u16),
        )
    }

    /// Global address of a cell within a tile
    pub fn cell_address(&self, tile: TileAddress, cell: CellCoord) -> CellAddress {
        let bits = self.dimension_bits as u32;
        CellAddress::new(
            (tile.x << bits) | cell.x as u32,
            (tile.y << bits) | cell.y as u32,
        )
    }
}

impl Default for IndexGeometry {
    fn default() -> Self {
        Self {
            levels: 6,
            dimension_bits: 5,
        }
    }
}

/// Time range (half-open interval: [start, end)), in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: i64,
    /// End timestamp (exclusive)
    pub end: i64,
}

impl TimeRange {
    /// Create a time range, returning None if invalid
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// The whole representable timeline
    pub const fn all() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Get intersection with another range, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        Self::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_builder() {
        let pass = Pass::new(1000, 12.5).machine(3).cmv(420).temperature(1200);

        assert_eq!(pass.machine_id, 3);
        assert_eq!(pass.cmv, 420);
        assert_eq!(pass.mdp, NULL_MDP);
        assert!(pass.has_height());
        assert!(pass.validate().is_ok());
        assert!(!Pass::new(1000, NULL_HEIGHT).has_height());
    }

    #[test]
    fn test_pass_validation() {
        assert!(Pass::new(i64::MIN, 1.0).validate().is_err());
        assert!(Pass::new(i64::MIN + 1, 1.0).validate().is_err());
        assert!(Pass::new(PASS_TIME_LIMIT + 1, 1.0).validate().is_err());
        assert!(Pass::new(PASS_TIME_LIMIT, 1.0).validate().is_ok());
        assert!(Pass::new(-PASS_TIME_LIMIT, 1.0).validate().is_ok());
        assert!(Pass::new(0, f32::NAN).validate().is_err());
        assert!(Pass::new(0, 1.0).temperature(5000).validate().is_err());
    }

    #[test]
    fn test_geometry_defaults() {
        let geometry = IndexGeometry::default();
        assert_eq!(geometry.dimension(), 32);
        assert_eq!(geometry.cells_per_tile(), 1024);
        assert_eq!(geometry.tiles_per_axis(), 1 << 25);
        assert!(IndexGeometry::new(1, 5).is_none());
        assert!(IndexGeometry::new(7, 5).is_none());
    }

    #[test]
    fn test_cell_addressing() {
        let geometry = IndexGeometry::default();
        let (tile, cell) = geometry.locate_cell(CellAddress::new(70, 33));
        assert_eq!(tile, TileAddress::new(2, 1));
        assert_eq!(cell, CellCoord::new(6, 1));
        assert_eq!(geometry.cell_address(tile, cell), CellAddress::new(70, 33));

        let index = geometry.cell_index(cell).unwrap();
        assert_eq!(geometry.cell_at(index), cell);
        assert!(geometry.cell_index(CellCoord::new(32, 0)).is_none());
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::try_new(1000, 2000).unwrap();
        assert!(range.contains(1000));
        assert!(!range.contains(2000));
        assert!(range.overlaps(&TimeRange::try_new(1999, 3000).unwrap()));
        assert!(!range.overlaps(&TimeRange::try_new(2000, 3000).unwrap()));
        assert!(TimeRange::try_new(5, 5).is_none());
        assert!(TimeRange::all().contains(0));
    }

    #[test]
    fn test_enum_codes() {
        for mode in [GpsMode::Fixed, GpsMode::Sbas, GpsMode::NoGps] {
            assert_eq!(GpsMode::from_code(mode.code()), mode);
        }
        assert_eq!(GpsAccuracy::from_code(99), GpsAccuracy::Unknown);
        assert!(GpsAccuracy::Fine < GpsAccuracy::Coarse);
    }
}
