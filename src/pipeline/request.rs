//! Query and partition requests
//!
//! A [`QueryRequest`] is what a caller submits. The pipeline splits it into
//! one [`PartitionRequest`] per division and hands each to the
//! [`PartitionExecutor`] of the node routed for that division.

use crate::buffers::MeasurementType;
use crate::pipeline::aggregator::{
    CmvSummaryAggregator, CutFillAggregator, ElevationStatisticsAggregator,
    PassCountSummaryAggregator, QueryAggregator, TemperatureSummaryAggregator,
};
use crate::pipeline::error::QueryResult;
use crate::pipeline::filter::QueryFilter;
use crate::storage::TileAddress;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default CMV band, percent of target
pub const DEFAULT_CMV_PERCENT: (u32, u32) = (80, 130);

/// Default temperature band, tenths of a degree
pub const DEFAULT_TEMPERATURE_BAND: (u16, u16) = (1_000, 1_500);

/// Which summary a query computes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryKind {
    PassCountSummary {
        target_override: Option<u16>,
    },
    CmvSummary {
        target_override: Option<i16>,
        min_percent: u32,
        max_percent: u32,
    },
    TemperatureSummary {
        min_temperature: u16,
        max_temperature: u16,
    },
    ElevationStatistics,
    CutFill {
        reference_elevation: f32,
        band_edges: Vec<f32>,
    },
}

impl QueryKind {
    /// The stock summary for a measurement type
    pub fn default_for(measurement_type: MeasurementType) -> Self {
        match measurement_type {
            MeasurementType::Height => QueryKind::ElevationStatistics,
            MeasurementType::PassCount => QueryKind::PassCountSummary {
                target_override: None,
            },
            MeasurementType::Cmv => QueryKind::CmvSummary {
                target_override: None,
                min_percent: DEFAULT_CMV_PERCENT.0,
                max_percent: DEFAULT_CMV_PERCENT.1,
            },
            MeasurementType::Temperature => QueryKind::TemperatureSummary {
                min_temperature: DEFAULT_TEMPERATURE_BAND.0,
                max_temperature: DEFAULT_TEMPERATURE_BAND.1,
            },
        }
    }

    pub fn measurement_type(&self) -> MeasurementType {
        match self {
            QueryKind::PassCountSummary { .. } => MeasurementType::PassCount,
            QueryKind::CmvSummary { .. } => MeasurementType::Cmv,
            QueryKind::TemperatureSummary { .. } => MeasurementType::Temperature,
            QueryKind::ElevationStatistics | QueryKind::CutFill { .. } => MeasurementType::Height,
        }
    }

    /// Empty aggregator for this kind; `cell_size` is the cell edge in metres
    pub fn aggregator(&self, cell_size: f64) -> QueryAggregator {
        match self {
            QueryKind::PassCountSummary { target_override } => {
                QueryAggregator::PassCount(PassCountSummaryAggregator::new(*target_override))
            }
            QueryKind::CmvSummary {
                target_override,
                min_percent,
                max_percent,
            } => QueryAggregator::Cmv(CmvSummaryAggregator::new(
                *target_override,
                *min_percent,
                *max_percent,
            )),
            QueryKind::TemperatureSummary {
                min_temperature,
                max_temperature,
            } => QueryAggregator::Temperature(TemperatureSummaryAggregator::new(
                *min_temperature,
                *max_temperature,
            )),
            QueryKind::ElevationStatistics => {
                QueryAggregator::Elevation(ElevationStatisticsAggregator::new(cell_size))
            }
            QueryKind::CutFill {
                reference_elevation,
                band_edges,
            } => QueryAggregator::CutFill(CutFillAggregator::new(
                *reference_elevation,
                band_edges,
                cell_size,
            )),
        }
    }
}

/// A query as submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub filter: QueryFilter,
    pub kind: QueryKind,
}

impl QueryRequest {
    pub fn new(filter: QueryFilter, kind: QueryKind) -> Self {
        Self { filter, kind }
    }
}

/// The slice of a query one node runs
#[derive(Debug, Clone)]
pub struct PartitionRequest {
    pub query_id: Uuid,
    pub division: u32,
    pub tiles: Vec<TileAddress>,
    pub filter: QueryFilter,
    /// Empty aggregator carrying the query's configuration
    pub aggregator: QueryAggregator,
}

/// A node's partial result for one division
#[derive(Debug, Clone)]
pub struct PartitionResponse {
    pub division: u32,
    pub node: Uuid,
    pub partial: QueryAggregator,
    pub tiles_processed: usize,
}

/// Runs partition requests on behalf of one node
#[async_trait]
pub trait PartitionExecutor: Send + Sync {
    fn node_id(&self) -> Uuid;

    async fn execute(&self, request: PartitionRequest) -> QueryResult<PartitionResponse>;
}
