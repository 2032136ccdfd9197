//! Query service
//!
//! Entry point for query-issuing callers. Submitting a query initiates its
//! pipeline against the cluster's current existence map and partition map,
//! then runs it on a tokio task; the caller keeps a [`QueryHandle`] to wait
//! for or cancel it. Results nobody collects are dropped once they have been
//! finished for longer than the service's retention window.

use crate::buffers::MeasurementType;
use crate::cluster::Cluster;
use crate::pipeline::aggregator::QueryResponse;
use crate::pipeline::error::{QueryError, QueryResult};
use crate::pipeline::execution::QueryPipeline;
use crate::pipeline::filter::{AttributeFilter, QueryFilter, SpatialFilter, TimeFilter};
use crate::pipeline::request::{QueryKind, QueryRequest};
use crate::pipeline::state::PipelineState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Default cell edge in metres
pub const DEFAULT_CELL_SIZE: f64 = 0.34;

/// How long a finished, unclaimed result stays awaitable
pub const DEFAULT_RESULT_RETENTION: Duration = Duration::from_secs(300);

/// Names a submitted query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryHandle {
    id: Uuid,
}

impl QueryHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

struct QueryEntry {
    pipeline: QueryPipeline,
    runner: JoinHandle<QueryResult<QueryResponse>>,
    /// First time the runner was seen finished
    finished_at: Option<Instant>,
}

/// Submits, awaits and cancels queries against a cluster
pub struct QueryService {
    cluster: Arc<Cluster>,
    cell_size: f64,
    retention: Duration,
    queries: Mutex<HashMap<Uuid, QueryEntry>>,
}

impl QueryService {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self::with_cell_size(cluster, DEFAULT_CELL_SIZE)
    }

    pub fn with_cell_size(cluster: Arc<Cluster>, cell_size: f64) -> Self {
        Self {
            cluster,
            cell_size,
            retention: DEFAULT_RESULT_RETENTION,
            queries: Mutex::new(HashMap::new()),
        }
    }

    /// Builder method: how long finished results wait to be claimed
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Submit the stock summary for `measurement_type`
    pub fn submit_query(
        &self,
        spatial: SpatialFilter,
        time: TimeFilter,
        attribute: AttributeFilter,
        measurement_type: MeasurementType,
    ) -> QueryResult<QueryHandle> {
        self.submit(QueryRequest::new(
            QueryFilter::new(spatial, time, attribute),
            QueryKind::default_for(measurement_type),
        ))
    }

    /// Initiate `request` and start running it. Must be called from within
    /// a tokio runtime.
    pub fn submit(&self, request: QueryRequest) -> QueryResult<QueryHandle> {
        let pipeline = QueryPipeline::new(request, self.cell_size);
        let cluster = &self.cluster;
        let plan = pipeline.initiate(
            &cluster.existence(),
            cluster.geometry(),
            cluster.affinity(),
            &cluster.partition_map(),
            |id| cluster.is_available(id),
        )?;
        info!(
            query_id = %pipeline.id(),
            kind = %pipeline.request().kind.measurement_type(),
            divisions = plan.work.len(),
            tiles = plan.tile_count(),
            "Query submitted"
        );

        let executors = cluster.executors();
        let runner = pipeline.clone();
        let runner = tokio::spawn(async move { runner.run(plan, &executors).await });

        self.evict_finished();
        let handle = QueryHandle { id: pipeline.id() };
        self.queries.lock().insert(
            handle.id,
            QueryEntry {
                pipeline,
                runner,
                finished_at: None,
            },
        );
        Ok(handle)
    }

    /// Drop results that finished more than the retention window ago and
    /// were never awaited. Runs on every submit; returns how many went.
    pub fn evict_finished(&self) -> usize {
        let now = Instant::now();
        let retention = self.retention;
        let mut queries = self.queries.lock();
        let before = queries.len();
        queries.retain(|id, entry| {
            if entry.finished_at.is_none() && entry.runner.is_finished() {
                entry.finished_at = Some(now);
            }
            let expired = entry
                .finished_at
                .is_some_and(|at| now.duration_since(at) >= retention);
            if expired {
                debug!(query_id = %id, state = %entry.pipeline.state(), "Evicting unclaimed result");
            }
            !expired
        });
        before - queries.len()
    }

    /// Wait for a query to finish. The handle is consumed; a second wait on
    /// it reports an unknown query, as does a wait on a result that sat
    /// unclaimed past the retention window.
    pub async fn await_result(&self, handle: QueryHandle) -> QueryResult<QueryResponse> {
        let entry = self
            .queries
            .lock()
            .remove(&handle.id)
            .ok_or(QueryError::UnknownQuery(handle.id))?;
        entry
            .runner
            .await
            .map_err(|err| QueryError::Execution(err.to_string()))?
    }

    /// Cancel a query. Returns false if it is unknown or already finished.
    pub fn cancel(&self, handle: QueryHandle) -> bool {
        let pipeline = self
            .queries
            .lock()
            .get(&handle.id)
            .map(|entry| entry.pipeline.clone());
        pipeline.is_some_and(|p| p.abort())
    }

    pub fn status(&self, handle: QueryHandle) -> Option<PipelineState> {
        self.queries.lock().get(&handle.id).map(|e| e.pipeline.state())
    }

    pub fn pipeline(&self, handle: QueryHandle) -> Option<QueryPipeline> {
        self.queries.lock().get(&handle.id).map(|e| e.pipeline.clone())
    }

    /// Queries submitted and neither awaited nor evicted
    pub fn pending(&self) -> usize {
        self.queries.lock().len()
    }
}

impl fmt::Debug for QueryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryService")
            .field("cluster", &self.cluster)
            .field("cell_size", &self.cell_size)
            .field("retention", &self.retention)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterConfig;
    use crate::storage::{CellCoord, Pass, TileAddress};

    fn service() -> QueryService {
        let cluster = Cluster::new(ClusterConfig {
            partition_count: 4,
            ..ClusterConfig::default()
        })
        .unwrap();
        QueryService::new(Arc::new(cluster))
    }

    #[tokio::test]
    async fn test_submit_and_await() {
        let service = service();
        for x in 0..8 {
            service
                .cluster()
                .append(TileAddress::new(x, 0), CellCoord::new(0, 0), Pass::new(5, 1.5))
                .unwrap();
        }

        let handle = service
            .submit_query(
                SpatialFilter::All,
                TimeFilter::all(),
                AttributeFilter::new(),
                MeasurementType::Height,
            )
            .unwrap();
        let QueryResponse::Elevation(stats) = service.await_result(handle).await.unwrap() else {
            panic!("wrong response")
        };
        assert_eq!(stats.cells, 8);
        assert_eq!(stats.mean_height, Some(1.5));
        assert_eq!(service.pending(), 0);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let service = service();
        let handle = QueryHandle { id: Uuid::new_v4() };
        assert!(!service.cancel(handle));
        assert!(matches!(
            service.await_result(handle).await,
            Err(QueryError::UnknownQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_unclaimed_results_are_evicted() {
        let cluster = Arc::clone(service().cluster());
        let service = QueryService::new(cluster).with_retention(Duration::ZERO);
        let submit = || {
            service
                .submit_query(
                    SpatialFilter::All,
                    TimeFilter::all(),
                    AttributeFilter::new(),
                    MeasurementType::PassCount,
                )
                .unwrap()
        };

        let abandoned = submit();
        let deadline = Instant::now() + Duration::from_secs(5);
        while service.evict_finished() == 0 {
            assert!(Instant::now() < deadline, "query never finished");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(service.pending(), 0);
        assert!(matches!(
            service.await_result(abandoned).await,
            Err(QueryError::UnknownQuery(_))
        ));

        // Running queries are never evicted
        let kept = submit();
        assert!(service.status(kept).is_some());
        assert!(service.await_result(kept).await.is_ok());
    }

    #[tokio::test]
    async fn test_retained_result_still_awaitable() {
        let service = service();
        let handle = service
            .submit_query(
                SpatialFilter::All,
                TimeFilter::all(),
                AttributeFilter::new(),
                MeasurementType::PassCount,
            )
            .unwrap();
        while !service.pipeline(handle).unwrap().state().is_terminal() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(service.evict_finished(), 0);
        assert!(service.await_result(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_site_completes() {
        let service = service();
        let handle = service
            .submit_query(
                SpatialFilter::All,
                TimeFilter::all(),
                AttributeFilter::new(),
                MeasurementType::PassCount,
            )
            .unwrap();
        let QueryResponse::PassCount(summary) = service.await_result(handle).await.unwrap() else {
            panic!("wrong response")
        };
        assert_eq!(summary.counts.cells, 0);
    }
}
