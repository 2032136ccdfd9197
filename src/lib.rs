//! # Groundwork
//!
//! Storage and query core for compaction-machine telemetry. Every pass a
//! roller makes over a cell is kept, in time order, in a spatially indexed
//! segment store; summary queries are split by spatial division, run on the
//! nodes serving each division and merged into one answer.
//!
//! ## Modules
//!
//! - [`storage`]: spatial index, segments, cleaving, existence map, persistence tiers
//! - [`codec`]: bit-packed column compaction for frozen segments
//! - [`affinity`]: tile → division mapping and partition assignment
//! - [`buffers`]: pooled client leaves for query execution
//! - [`pipeline`]: query lifecycle, filters, aggregators, query service
//! - [`cluster`]: in-process nodes executing partition requests
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use groundwork::cluster::{Cluster, ClusterConfig};
//! use groundwork::pipeline::{AttributeFilter, QueryService, SpatialFilter, TimeFilter};
//! use groundwork::buffers::MeasurementType;
//! use groundwork::storage::{CellCoord, Pass, TileAddress};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = Arc::new(Cluster::new(ClusterConfig::default())?);
//!     cluster.append(TileAddress::new(3, 7), CellCoord::new(0, 0), Pass::new(1_000, 101.25))?;
//!
//!     let service = QueryService::new(cluster);
//!     let handle = service.submit_query(
//!         SpatialFilter::All,
//!         TimeFilter::all(),
//!         AttributeFilter::new(),
//!         MeasurementType::Height,
//!     )?;
//!     println!("{:?}", service.await_result(handle).await?);
//!     Ok(())
//! }
//! ```

pub mod affinity;
pub mod buffers;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod pipeline;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    CellCoord, ExistenceMap, IndexGeometry, Pass, PassEvents, SegmentStore, StorageError,
    StorageResult, StoreConfig, TileAddress, TimeRange,
};

pub use affinity::{division_of, AffinityError, ClusterNode, NodeRole, PartitionMap, SpatialAffinity};

pub use buffers::{BufferError, ClientLeaf, ClientLeafFactory, MeasurementType};

pub use pipeline::{
    Aggregator, AttributeFilter, PipelineState, QueryError, QueryFilter, QueryHandle, QueryKind,
    QueryRequest, QueryResponse, QueryResult, QueryService, SpatialFilter, TimeFilter,
};

pub use cluster::{Cluster, ClusterConfig, ClusterError, ComputeNode};

pub use config::{generate_default_config, Config, ConfigError, LoggingConfig};
