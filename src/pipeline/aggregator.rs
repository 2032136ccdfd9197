//! Aggregators
//!
//! An aggregator folds populated client leaves into a per-query accumulator.
//! Partials built on different workers or nodes are merged with
//! [`Aggregator::combine`], which is associative and commutative, so they
//! may arrive in any order and be reduced in any grouping.
//!
//! All accumulators keep integer state (counts, millimetre sums) so that
//! regrouping never changes a result.
//!
//! Aggregators are not internally synchronized. Callers updating one from
//! several threads must serialize access; the node executor instead gives
//! every worker its own accumulator and combines them at the end.

use crate::buffers::{has_cmv_target, ClientLeaf, MeasurementType};
use crate::codec::height_to_mm;
use crate::storage::NULL_TARGET_PASS_COUNT;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-query accumulator contract
pub trait Aggregator: Send + Sized {
    type Output;

    /// Leaf kind this aggregator consumes
    fn measurement_type(&self) -> MeasurementType;

    /// Empty accumulator sharing this one's configuration
    fn fresh(&self) -> Self;

    fn process_leaf(&mut self, leaf: &ClientLeaf);

    /// Fold another partial into this one
    fn merge(&mut self, other: Self);

    /// Accept a partial result from a partition
    fn process_partial(&mut self, partial: Self) {
        self.merge(partial);
    }

    fn combine(mut self, other: Self) -> Self {
        self.merge(other);
        self
    }

    fn finalize(self) -> Self::Output;
}

/// Cells classified against a target or band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub cells: u64,
    pub below: u64,
    pub within: u64,
    pub above: u64,
    /// Cells with a value but no usable target
    pub no_target: u64,
}

impl SummaryCounts {
    fn classify<T: PartialOrd>(&mut self, value: T, low: T, high: T) {
        self.cells += 1;
        if value < low {
            self.below += 1;
        } else if value > high {
            self.above += 1;
        } else {
            self.within += 1;
        }
    }

    fn untargeted(&mut self) {
        self.cells += 1;
        self.no_target += 1;
    }

    pub fn merge(&mut self, other: &SummaryCounts) {
        self.cells += other.cells;
        self.below += other.below;
        self.within += other.within;
        self.above += other.above;
        self.no_target += other.no_target;
    }

    fn percent(&self, n: u64) -> f64 {
        let classified = self.cells - self.no_target;
        if classified == 0 {
            0.0
        } else {
            n as f64 * 100.0 / classified as f64
        }
    }

    pub fn percent_below(&self) -> f64 {
        self.percent(self.below)
    }

    pub fn percent_within(&self) -> f64 {
        self.percent(self.within)
    }

    pub fn percent_above(&self) -> f64 {
        self.percent(self.above)
    }
}

/// Tracks whether every observed target agreed. Keeps the smallest
/// target seen so merging stays order independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTracker<T> {
    value: Option<T>,
    constant: bool,
}

impl<T> Default for TargetTracker<T> {
    fn default() -> Self {
        Self {
            value: None,
            constant: true,
        }
    }
}

impl<T: Copy + Ord> TargetTracker<T> {
    pub fn observe(&mut self, target: T) {
        match self.value {
            None => self.value = Some(target),
            Some(current) if current != target => {
                self.constant = false;
                self.value = Some(current.min(target));
            }
            Some(_) => {}
        }
    }

    pub fn merge(&mut self, other: &TargetTracker<T>) {
        if let Some(target) = other.value {
            self.observe(target);
        }
        self.constant &= other.constant;
    }

    pub fn value(&self) -> Option<T> {
        self.value
    }

    /// False once two different targets have been seen
    pub fn is_constant(&self) -> bool {
        self.constant
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassCountSummary {
    pub counts: SummaryCounts,
    pub total_passes: u64,
    pub target: Option<u16>,
    pub target_constant: bool,
}

/// Pass counts against the machine (or overriding) target pass count
#[derive(Debug, Clone, PartialEq)]
pub struct PassCountSummaryAggregator {
    target_override: Option<u16>,
    counts: SummaryCounts,
    total_passes: u64,
    target: TargetTracker<u16>,
}

impl PassCountSummaryAggregator {
    pub fn new(target_override: Option<u16>) -> Self {
        Self {
            target_override,
            counts: SummaryCounts::default(),
            total_passes: 0,
            target: TargetTracker::default(),
        }
    }
}

impl Aggregator for PassCountSummaryAggregator {
    type Output = PassCountSummary;

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::PassCount
    }

    fn fresh(&self) -> Self {
        Self::new(self.target_override)
    }

    fn process_leaf(&mut self, leaf: &ClientLeaf) {
        let ClientLeaf::PassCount(leaf) = leaf else { return };
        for (_, cell) in leaf.grid.iter() {
            self.total_passes += cell.count as u64;
            let machine_target = (cell.target != NULL_TARGET_PASS_COUNT).then_some(cell.target);
            if let Some(target) = machine_target {
                self.target.observe(target);
            }
            match self.target_override.or(machine_target) {
                Some(target) => self.counts.classify(cell.count, target as u32, target as u32),
                None => self.counts.untargeted(),
            }
        }
    }

    fn merge(&mut self, other: Self) {
        self.counts.merge(&other.counts);
        self.total_passes += other.total_passes;
        self.target.merge(&other.target);
    }

    fn finalize(self) -> PassCountSummary {
        PassCountSummary {
            counts: self.counts,
            total_passes: self.total_passes,
            target: self.target_override.or(self.target.value()),
            target_constant: self.target.is_constant(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmvSummary {
    pub counts: SummaryCounts,
    pub mean_cmv: Option<f64>,
    pub target: Option<i16>,
    pub target_constant: bool,
}

/// Compaction values against a percentage band around the target
#[derive(Debug, Clone, PartialEq)]
pub struct CmvSummaryAggregator {
    target_override: Option<i16>,
    min_percent: u32,
    max_percent: u32,
    counts: SummaryCounts,
    cmv_sum: i64,
    cmv_cells: u64,
    target: TargetTracker<i16>,
}

impl CmvSummaryAggregator {
    /// Band is `[target × min_percent / 100, target × max_percent / 100]`
    pub fn new(target_override: Option<i16>, min_percent: u32, max_percent: u32) -> Self {
        Self {
            target_override,
            min_percent: min_percent.min(max_percent),
            max_percent: min_percent.max(max_percent),
            counts: SummaryCounts::default(),
            cmv_sum: 0,
            cmv_cells: 0,
            target: TargetTracker::default(),
        }
    }
}

impl Aggregator for CmvSummaryAggregator {
    type Output = CmvSummary;

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::Cmv
    }

    fn fresh(&self) -> Self {
        Self::new(self.target_override, self.min_percent, self.max_percent)
    }

    fn process_leaf(&mut self, leaf: &ClientLeaf) {
        let ClientLeaf::Cmv(leaf) = leaf else { return };
        for (_, cell) in leaf.grid.iter() {
            self.cmv_sum += cell.cmv as i64;
            self.cmv_cells += 1;
            let machine_target = has_cmv_target(cell.target).then_some(cell.target);
            if let Some(target) = machine_target {
                self.target.observe(target);
            }
            match self.target_override.or(machine_target).filter(|&t| t > 0) {
                Some(target) => {
                    // Compare in hundredths to stay in integers
                    let value = cell.cmv as i64 * 100;
                    let low = target as i64 * self.min_percent as i64;
                    let high = target as i64 * self.max_percent as i64;
                    self.counts.classify(value, low, high);
                }
                None => self.counts.untargeted(),
            }
        }
    }

    fn merge(&mut self, other: Self) {
        self.counts.merge(&other.counts);
        self.cmv_sum += other.cmv_sum;
        self.cmv_cells += other.cmv_cells;
        self.target.merge(&other.target);
    }

    fn finalize(self) -> CmvSummary {
        CmvSummary {
            counts: self.counts,
            mean_cmv: (self.cmv_cells > 0).then(|| self.cmv_sum as f64 / self.cmv_cells as f64),
            target: self.target_override.or(self.target.value()),
            target_constant: self.target.is_constant(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSummary {
    pub counts: SummaryCounts,
    /// Tenths of a degree
    pub min_temperature: Option<u16>,
    pub max_temperature: Option<u16>,
}

/// Material temperatures against a fixed band (tenths of a degree)
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureSummaryAggregator {
    band: (u16, u16),
    counts: SummaryCounts,
    observed: Option<(u16, u16)>,
}

impl TemperatureSummaryAggregator {
    pub fn new(min_temperature: u16, max_temperature: u16) -> Self {
        Self {
            band: (min_temperature.min(max_temperature), min_temperature.max(max_temperature)),
            counts: SummaryCounts::default(),
            observed: None,
        }
    }
}

impl Aggregator for TemperatureSummaryAggregator {
    type Output = TemperatureSummary;

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::Temperature
    }

    fn fresh(&self) -> Self {
        Self::new(self.band.0, self.band.1)
    }

    fn process_leaf(&mut self, leaf: &ClientLeaf) {
        let ClientLeaf::Temperature(leaf) = leaf else { return };
        for (_, cell) in leaf.grid.iter() {
            let t = cell.temperature;
            self.counts.classify(t, self.band.0, self.band.1);
            self.observed = Some(match self.observed {
                None => (t, t),
                Some((lo, hi)) => (lo.min(t), hi.max(t)),
            });
        }
    }

    fn merge(&mut self, other: Self) {
        self.counts.merge(&other.counts);
        self.observed = match (self.observed, other.observed) {
            (Some((a, b)), Some((c, d))) => Some((a.min(c), b.max(d))),
            (a, b) => a.or(b),
        };
    }

    fn finalize(self) -> TemperatureSummary {
        TemperatureSummary {
            counts: self.counts,
            min_temperature: self.observed.map(|o| o.0),
            max_temperature: self.observed.map(|o| o.1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElevationStatistics {
    pub cells: u64,
    pub min_height: Option<f64>,
    pub max_height: Option<f64>,
    pub mean_height: Option<f64>,
    /// Square metres covered by cells with an elevation
    pub coverage_area: f64,
}

/// Elevation extents and mean over the latest elevation of each cell
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationStatisticsAggregator {
    cell_area: f64,
    cells: u64,
    extents_mm: Option<(i32, i32)>,
    sum_mm: i64,
}

impl ElevationStatisticsAggregator {
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_area: cell_size * cell_size,
            cells: 0,
            extents_mm: None,
            sum_mm: 0,
        }
    }
}

impl Aggregator for ElevationStatisticsAggregator {
    type Output = ElevationStatistics;

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::Height
    }

    fn fresh(&self) -> Self {
        Self {
            cell_area: self.cell_area,
            ..Self::new(0.0)
        }
    }

    fn process_leaf(&mut self, leaf: &ClientLeaf) {
        let ClientLeaf::Height(leaf) = leaf else { return };
        for (_, cell) in leaf.grid.iter() {
            let mm = height_to_mm(cell.height);
            self.cells += 1;
            self.sum_mm += mm as i64;
            self.extents_mm = Some(match self.extents_mm {
                None => (mm, mm),
                Some((lo, hi)) => (lo.min(mm), hi.max(mm)),
            });
        }
    }

    fn merge(&mut self, other: Self) {
        self.cells += other.cells;
        self.sum_mm += other.sum_mm;
        self.extents_mm = match (self.extents_mm, other.extents_mm) {
            (Some((a, b)), Some((c, d))) => Some((a.min(c), b.max(d))),
            (a, b) => a.or(b),
        };
    }

    fn finalize(self) -> ElevationStatistics {
        ElevationStatistics {
            cells: self.cells,
            min_height: self.extents_mm.map(|e| e.0 as f64 / 1000.0),
            max_height: self.extents_mm.map(|e| e.1 as f64 / 1000.0),
            mean_height: (self.cells > 0).then(|| self.sum_mm as f64 / 1000.0 / self.cells as f64),
            coverage_area: self.cells as f64 * self.cell_area,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutFillSummary {
    pub cells: u64,
    /// Offsets from the reference (metres) separating the bands
    pub band_edges: Vec<f64>,
    /// Cells per band; one more entry than there are edges
    pub band_counts: Vec<u64>,
    /// Cubic metres above the reference
    pub cut_volume: f64,
    /// Cubic metres below the reference
    pub fill_volume: f64,
}

/// Latest elevations compared against a flat reference surface
#[derive(Debug, Clone, PartialEq)]
pub struct CutFillAggregator {
    reference_mm: i32,
    edges_mm: Vec<i32>,
    cell_area: f64,
    cells: u64,
    band_counts: Vec<u64>,
    cut_mm: i64,
    fill_mm: i64,
}

impl CutFillAggregator {
    /// `band_edges` are offsets from `reference_elevation` in metres
    pub fn new(reference_elevation: f32, band_edges: &[f32], cell_size: f64) -> Self {
        let mut edges_mm: Vec<i32> = band_edges.iter().map(|&e| height_to_mm(e)).collect();
        edges_mm.sort_unstable();
        edges_mm.dedup();
        Self {
            reference_mm: height_to_mm(reference_elevation),
            band_counts: vec![0; edges_mm.len() + 1],
            edges_mm,
            cell_area: cell_size * cell_size,
            cells: 0,
            cut_mm: 0,
            fill_mm: 0,
        }
    }
}

impl Aggregator for CutFillAggregator {
    type Output = CutFillSummary;

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::Height
    }

    fn fresh(&self) -> Self {
        Self {
            reference_mm: self.reference_mm,
            edges_mm: self.edges_mm.clone(),
            cell_area: self.cell_area,
            cells: 0,
            band_counts: vec![0; self.edges_mm.len() + 1],
            cut_mm: 0,
            fill_mm: 0,
        }
    }

    fn process_leaf(&mut self, leaf: &ClientLeaf) {
        let ClientLeaf::Height(leaf) = leaf else { return };
        for (_, cell) in leaf.grid.iter() {
            let offset = height_to_mm(cell.height) as i64 - self.reference_mm as i64;
            let band = self.edges_mm.partition_point(|&edge| (edge as i64) <= offset);
            self.band_counts[band] += 1;
            self.cells += 1;
            if offset > 0 {
                self.cut_mm += offset;
            } else {
                self.fill_mm -= offset;
            }
        }
    }

    fn merge(&mut self, other: Self) {
        if other.band_counts.len() != self.band_counts.len() {
            warn!(
                ours = self.band_counts.len(),
                theirs = other.band_counts.len(),
                "Ignoring cut/fill partial with different bands"
            );
            return;
        }
        for (mine, theirs) in self.band_counts.iter_mut().zip(&other.band_counts) {
            *mine += theirs;
        }
        self.cells += other.cells;
        self.cut_mm += other.cut_mm;
        self.fill_mm += other.fill_mm;
    }

    fn finalize(self) -> CutFillSummary {
        CutFillSummary {
            cells: self.cells,
            band_edges: self.edges_mm.iter().map(|&e| e as f64 / 1000.0).collect(),
            band_counts: self.band_counts,
            cut_volume: self.cut_mm as f64 / 1000.0 * self.cell_area,
            fill_volume: self.fill_mm as f64 / 1000.0 * self.cell_area,
        }
    }
}

/// Final result of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryResponse {
    PassCount(PassCountSummary),
    Cmv(CmvSummary),
    Temperature(TemperatureSummary),
    Elevation(ElevationStatistics),
    CutFill(CutFillSummary),
}

/// Closed set of aggregators a query can run
#[derive(Debug, Clone, PartialEq)]
pub enum QueryAggregator {
    PassCount(PassCountSummaryAggregator),
    Cmv(CmvSummaryAggregator),
    Temperature(TemperatureSummaryAggregator),
    Elevation(ElevationStatisticsAggregator),
    CutFill(CutFillAggregator),
}

impl QueryAggregator {
    fn kind(&self) -> &'static str {
        match self {
            QueryAggregator::PassCount(_) => "pass_count",
            QueryAggregator::Cmv(_) => "cmv",
            QueryAggregator::Temperature(_) => "temperature",
            QueryAggregator::Elevation(_) => "elevation",
            QueryAggregator::CutFill(_) => "cut_fill",
        }
    }
}

impl Aggregator for QueryAggregator {
    type Output = QueryResponse;

    fn measurement_type(&self) -> MeasurementType {
        match self {
            QueryAggregator::PassCount(a) => a.measurement_type(),
            QueryAggregator::Cmv(a) => a.measurement_type(),
            QueryAggregator::Temperature(a) => a.measurement_type(),
            QueryAggregator::Elevation(a) => a.measurement_type(),
            QueryAggregator::CutFill(a) => a.measurement_type(),
        }
    }

    fn fresh(&self) -> Self {
        match self {
            QueryAggregator::PassCount(a) => QueryAggregator::PassCount(a.fresh()),
            QueryAggregator::Cmv(a) => QueryAggregator::Cmv(a.fresh()),
            QueryAggregator::Temperature(a) => QueryAggregator::Temperature(a.fresh()),
            QueryAggregator::Elevation(a) => QueryAggregator::Elevation(a.fresh()),
            QueryAggregator::CutFill(a) => QueryAggregator::CutFill(a.fresh()),
        }
    }

    fn process_leaf(&mut self, leaf: &ClientLeaf) {
        match self {
            QueryAggregator::PassCount(a) => a.process_leaf(leaf),
            QueryAggregator::Cmv(a) => a.process_leaf(leaf),
            QueryAggregator::Temperature(a) => a.process_leaf(leaf),
            QueryAggregator::Elevation(a) => a.process_leaf(leaf),
            QueryAggregator::CutFill(a) => a.process_leaf(leaf),
        }
    }

    fn merge(&mut self, other: Self) {
        match (self, other) {
            (QueryAggregator::PassCount(a), QueryAggregator::PassCount(b)) => a.merge(b),
            (QueryAggregator::Cmv(a), QueryAggregator::Cmv(b)) => a.merge(b),
            (QueryAggregator::Temperature(a), QueryAggregator::Temperature(b)) => a.merge(b),
            (QueryAggregator::Elevation(a), QueryAggregator::Elevation(b)) => a.merge(b),
            (QueryAggregator::CutFill(a), QueryAggregator::CutFill(b)) => a.merge(b),
            (ours, theirs) => warn!(
                ours = ours.kind(),
                theirs = theirs.kind(),
                "Ignoring partial from a different aggregator"
            ),
        }
    }

    fn finalize(self) -> QueryResponse {
        match self {
            QueryAggregator::PassCount(a) => QueryResponse::PassCount(a.finalize()),
            QueryAggregator::Cmv(a) => QueryResponse::Cmv(a.finalize()),
            QueryAggregator::Temperature(a) => QueryResponse::Temperature(a.finalize()),
            QueryAggregator::Elevation(a) => QueryResponse::Elevation(a.finalize()),
            QueryAggregator::CutFill(a) => QueryResponse::CutFill(a.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mm_to_height;
    use crate::storage::{Pass, PassEvents};
    use proptest::prelude::*;

    fn pass_count_leaf(cells: &[(u32, u16)]) -> ClientLeaf {
        let mut leaf = ClientLeaf::pass_count(64);
        for (index, &(count, target)) in cells.iter().enumerate() {
            let events = PassEvents {
                target_pass_count: target,
                ..PassEvents::default()
            };
            let passes: Vec<Pass> = (0..count).map(|t| Pass::new(t as i64, 1.0).events(events)).collect();
            leaf.assign(index, &passes);
        }
        leaf
    }

    fn height_leaf(heights_mm: &[i32]) -> ClientLeaf {
        let mut leaf = ClientLeaf::height(64);
        for (index, &mm) in heights_mm.iter().enumerate() {
            leaf.assign(index, &[Pass::new(1, mm_to_height(mm))]);
        }
        leaf
    }

    #[test]
    fn test_pass_count_against_machine_target() {
        let mut aggregator = PassCountSummaryAggregator::new(None);
        aggregator.process_leaf(&pass_count_leaf(&[(3, 4), (4, 4), (6, 4), (2, 0)]));
        let summary = aggregator.finalize();

        assert_eq!(summary.counts.below, 1);
        assert_eq!(summary.counts.within, 1);
        assert_eq!(summary.counts.above, 1);
        assert_eq!(summary.counts.no_target, 1);
        assert_eq!(summary.total_passes, 15);
        assert_eq!(summary.target, Some(4));
        assert!(summary.target_constant);
    }

    #[test]
    fn test_target_change_breaks_constancy() {
        let mut a = PassCountSummaryAggregator::new(Some(5));
        a.process_leaf(&pass_count_leaf(&[(5, 4)]));
        let mut b = a.fresh();
        b.process_leaf(&pass_count_leaf(&[(5, 6)]));

        let summary = a.combine(b).finalize();
        assert!(!summary.target_constant);
        assert_eq!(summary.target, Some(5));
        assert_eq!(summary.counts.within, 2);
    }

    #[test]
    fn test_cmv_band() {
        let mut leaf = ClientLeaf::cmv(8);
        let events = PassEvents {
            target_cmv: 100,
            ..PassEvents::default()
        };
        for (index, cmv) in [70i16, 80, 120, 131].into_iter().enumerate() {
            leaf.assign(index, &[Pass::new(1, 1.0).cmv(cmv).events(events)]);
        }
        let mut aggregator = CmvSummaryAggregator::new(None, 80, 130);
        aggregator.process_leaf(&leaf);
        let summary = aggregator.finalize();

        assert_eq!((summary.counts.below, summary.counts.within, summary.counts.above), (1, 2, 1));
        assert_eq!(summary.mean_cmv, Some(100.25));
        assert_eq!(summary.target, Some(100));
    }

    #[test]
    fn test_temperature_band() {
        let mut leaf = ClientLeaf::temperature(8);
        for (index, t) in [900u16, 1_200, 1_600].into_iter().enumerate() {
            leaf.assign(index, &[Pass::new(1, 1.0).temperature(t)]);
        }
        let mut aggregator = TemperatureSummaryAggregator::new(1_500, 1_000);
        aggregator.process_leaf(&leaf);
        let summary = aggregator.finalize();

        assert_eq!((summary.counts.below, summary.counts.within, summary.counts.above), (1, 1, 1));
        assert_eq!(summary.min_temperature, Some(900));
        assert_eq!(summary.max_temperature, Some(1_600));
    }

    #[test]
    fn test_elevation_statistics() {
        let mut aggregator = ElevationStatisticsAggregator::new(0.5);
        aggregator.process_leaf(&height_leaf(&[1_000, 2_000, 3_000]));
        let stats = aggregator.finalize();

        assert_eq!(stats.cells, 3);
        assert_eq!(stats.min_height, Some(1.0));
        assert_eq!(stats.max_height, Some(3.0));
        assert_eq!(stats.mean_height, Some(2.0));
        assert_eq!(stats.coverage_area, 0.75);
    }

    #[test]
    fn test_cut_fill_bands_and_volumes() {
        let mut aggregator = CutFillAggregator::new(10.0, &[0.1, -0.1], 1.0);
        aggregator.process_leaf(&height_leaf(&[9_800, 10_000, 10_050, 10_300]));
        let summary = aggregator.finalize();

        assert_eq!(summary.band_edges, vec![-0.1, 0.1]);
        assert_eq!(summary.band_counts, vec![1, 2, 1]);
        assert!((summary.cut_volume - 0.35).abs() < 1e-9);
        assert!((summary.fill_volume - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_mismatched_partial_ignored() {
        let mut ours = QueryAggregator::Elevation(ElevationStatisticsAggregator::new(1.0));
        ours.process_leaf(&height_leaf(&[5_000]));
        ours.merge(QueryAggregator::PassCount(PassCountSummaryAggregator::new(None)));

        let QueryResponse::Elevation(stats) = ours.finalize() else { panic!("wrong response") };
        assert_eq!(stats.cells, 1);
    }

    fn partial_from(cells: &[(u32, u16)], heights: &[i32]) -> (PassCountSummaryAggregator, CutFillAggregator) {
        let mut passes = PassCountSummaryAggregator::new(None);
        passes.process_leaf(&pass_count_leaf(cells));
        let mut cut_fill = CutFillAggregator::new(5.0, &[-0.5, 0.0, 0.5], 0.34);
        cut_fill.process_leaf(&height_leaf(heights));
        (passes, cut_fill)
    }

    proptest! {
        #[test]
        fn prop_combine_is_associative_and_commutative(
            partials in proptest::collection::vec(
                (
                    proptest::collection::vec((1u32..12, 0u16..4), 0..20),
                    proptest::collection::vec(3_000i32..7_000, 0..20),
                ),
                3..6,
            )
        ) {
            let built: Vec<_> = partials.iter().map(|(c, h)| partial_from(c, h)).collect();

            // Left fold in arrival order
            let forward = built
                .iter()
                .cloned()
                .reduce(|(p1, c1), (p2, c2)| (p1.combine(p2), c1.combine(c2)))
                .unwrap();
            // Reverse order, grouped from the right
            let backward = built
                .iter()
                .rev()
                .cloned()
                .reduce(|(p1, c1), (p2, c2)| (p2.combine(p1), c2.combine(c1)))
                .unwrap();

            prop_assert_eq!(forward.0.finalize(), backward.0.finalize());
            prop_assert_eq!(forward.1.finalize(), backward.1.finalize());
        }
    }
}
