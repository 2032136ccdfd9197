//! Query pipeline
//!
//! A query moves through a fixed lifecycle:
//!
//! ```text
//!   submit ─► QueryPipeline (Created)
//!               │ initiate: prune tiles, group by division, route
//!               ▼
//!             Initiated ─► run: PartitionRequest per division
//!               │              │
//!               │              ▼
//!               │        PartitionExecutor (node) ─► PartitionResponse
//!               │              │
//!               │              ▼
//!               │        Task::transfer_response ─► aggregator.process_partial
//!               ▼
//!             Completed (finalize) │ Aborted (cancel / failure)
//! ```
//!
//! Aggregators are combined associatively and commutatively, so node-local
//! worker results and cross-node partials can arrive in any order.

pub mod aggregator;
pub mod error;
pub mod execution;
pub mod filter;
pub mod request;
pub mod service;
pub mod state;
pub mod task;

pub use aggregator::{
    Aggregator, CmvSummary, CmvSummaryAggregator, CutFillAggregator, CutFillSummary,
    ElevationStatistics, ElevationStatisticsAggregator, PassCountSummary,
    PassCountSummaryAggregator, QueryAggregator, QueryResponse, SummaryCounts, TargetTracker,
    TemperatureSummary, TemperatureSummaryAggregator,
};
pub use error::{QueryError, QueryResult};
pub use execution::{DivisionWork, ExecutionPlan, QueryPipeline};
pub use filter::{AttributeFilter, QueryFilter, SpatialFilter, TimeFilter};
pub use request::{
    PartitionExecutor, PartitionRequest, PartitionResponse, QueryKind, QueryRequest,
    DEFAULT_CMV_PERCENT, DEFAULT_TEMPERATURE_BAND,
};
pub use service::{QueryHandle, QueryService, DEFAULT_CELL_SIZE};
pub use state::PipelineState;
pub use task::Task;
