//! Query pipeline driver
//!
//! ```text
//!  initiate: existence map ─► spatial filter ─► group by division ─► route
//!  run:      dispatch per division ─► executor.execute() ─► Task ─► aggregator
//!                                                    finalize ◄─┘
//! ```
//!
//! Cancellation is cooperative. [`QueryPipeline::abort`] raises a flag that
//! the dispatch loop checks before each request and the [`Task`] checks
//! around each partial. Requests already dispatched keep running on their
//! node but their responses are dropped.

use crate::affinity::{PartitionMap, SpatialAffinity};
use crate::pipeline::aggregator::{Aggregator, QueryAggregator, QueryResponse};
use crate::pipeline::error::{QueryError, QueryResult};
use crate::pipeline::request::{PartitionExecutor, PartitionRequest, QueryRequest};
use crate::pipeline::state::PipelineState;
use crate::pipeline::task::{PipelineCore, Task};
use crate::storage::{ExistenceMap, IndexGeometry, TileAddress};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tiles one node must process for one division
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivisionWork {
    pub division: u32,
    pub node: Uuid,
    pub tiles: Vec<TileAddress>,
}

/// Routed work list produced by [`QueryPipeline::initiate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub work: Vec<DivisionWork>,
    /// Tiles dropped because no node could serve their division
    pub skipped_tiles: usize,
}

impl ExecutionPlan {
    pub fn tile_count(&self) -> usize {
        self.work.iter().map(|w| w.tiles.len()).sum()
    }
}

/// One query's execution
#[derive(Debug, Clone)]
pub struct QueryPipeline {
    core: Arc<PipelineCore>,
    task: Arc<Task>,
    request: Arc<QueryRequest>,
    prototype: QueryAggregator,
}

impl QueryPipeline {
    pub fn new(request: QueryRequest, cell_size: f64) -> Self {
        let prototype = request.kind.aggregator(cell_size);
        let core = Arc::new(PipelineCore::new(Uuid::new_v4(), prototype.fresh()));
        Self {
            task: Arc::new(Task::new(Arc::clone(&core))),
            core,
            request: Arc::new(request),
            prototype,
        }
    }

    pub fn id(&self) -> Uuid {
        self.core.query_id()
    }

    pub fn state(&self) -> PipelineState {
        self.core.state()
    }

    pub fn request(&self) -> &QueryRequest {
        &self.request
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// `(received, expected)` partition responses
    pub fn progress(&self) -> (usize, usize) {
        self.core.progress()
    }

    /// Build the routed work list and move to `Initiated`.
    ///
    /// Tiles absent from `existence` or outside the spatial filter are
    /// pruned. Divisions with no available node are logged and skipped.
    pub fn initiate(
        &self,
        existence: &ExistenceMap,
        geometry: IndexGeometry,
        affinity: &SpatialAffinity,
        partition_map: &PartitionMap,
        available: impl Fn(&Uuid) -> bool,
    ) -> QueryResult<ExecutionPlan> {
        let spatial = &self.request.filter.spatial;
        let mut by_division: BTreeMap<u32, Vec<TileAddress>> = BTreeMap::new();
        if !self.request.filter.time.is_empty() {
            for tile in existence.iter().filter(|t| spatial.intersects_tile(*t, geometry)) {
                by_division.entry(affinity.division_of(tile)).or_default().push(tile);
            }
        }

        let mut plan = ExecutionPlan::default();
        for (division, tiles) in by_division {
            match partition_map.route(division, &available) {
                Some(node) => plan.work.push(DivisionWork { division, node, tiles }),
                None => {
                    warn!(
                        query_id = %self.id(),
                        division,
                        tiles = tiles.len(),
                        "No eligible node for division, skipping its tiles"
                    );
                    plan.skipped_tiles += tiles.len();
                }
            }
        }

        self.core.set_expected(plan.work.len());
        self.core.transition(PipelineState::Initiated)?;
        if self.core.is_aborted() {
            self.abort_initiated();
            return Err(QueryError::Aborted);
        }
        debug!(
            query_id = %self.id(),
            divisions = plan.work.len(),
            tiles = plan.tile_count(),
            skipped = plan.skipped_tiles,
            "Query initiated"
        );
        Ok(plan)
    }

    /// Dispatch `plan` and collect the responses into a final result.
    ///
    /// A failing division does not stop its siblings; their partials are
    /// still merged, but the query then reports the first failure.
    pub async fn run(
        &self,
        plan: ExecutionPlan,
        executors: &HashMap<Uuid, Arc<dyn PartitionExecutor>>,
    ) -> QueryResult<QueryResponse> {
        if self.core.is_aborted() {
            return Err(QueryError::Aborted);
        }
        self.core.transition(PipelineState::Running)?;

        let mut in_flight = JoinSet::new();
        let mut failures = Vec::new();
        for work in plan.work {
            if self.core.is_aborted() {
                break;
            }
            let Some(executor) = executors.get(&work.node).cloned() else {
                error!(query_id = %self.id(), division = work.division, node = %work.node, "Routed node has no executor");
                failures.push(QueryError::NoEligibleNodes { division: work.division });
                continue;
            };
            let request = PartitionRequest {
                query_id: self.id(),
                division: work.division,
                tiles: work.tiles,
                filter: self.request.filter.clone(),
                aggregator: self.prototype.fresh(),
            };
            in_flight.spawn(async move {
                let division = request.division;
                (division, executor.execute(request).await)
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = self.core.aborted() => {
                    in_flight.detach_all();
                    return Err(QueryError::Aborted);
                }
                joined = in_flight.join_next() => match joined {
                    None => break,
                    Some(Ok((_, Ok(response)))) => {
                        self.task.transfer_response(response);
                    }
                    Some(Ok((division, Err(err)))) => {
                        error!(query_id = %self.id(), division, error = %err, "Partition failed");
                        failures.push(QueryError::PartitionFailed { division, message: err.to_string() });
                    }
                    Some(Err(err)) => {
                        error!(query_id = %self.id(), error = %err, "Partition task did not complete");
                        failures.push(QueryError::Execution(err.to_string()));
                    }
                },
            }
        }

        if self.core.is_aborted() {
            return Err(QueryError::Aborted);
        }
        if !failures.is_empty() {
            let failed = failures.len();
            if self.core.abort() {
                self.task.detach();
            }
            let first = failures.swap_remove(0);
            warn!(query_id = %self.id(), failed, "Query failed");
            return Err(first);
        }

        let aggregator = self.core.take_aggregator().ok_or(QueryError::Aborted)?;
        let response = aggregator.finalize();
        self.core.transition(PipelineState::Completed).map_err(|_| QueryError::Aborted)?;
        let (received, expected) = self.progress();
        info!(query_id = %self.id(), received, expected, "Query completed");
        Ok(response)
    }

    /// Cancel the query. Returns false if it had already finished.
    pub fn abort(&self) -> bool {
        let aborted = self.core.abort();
        if aborted {
            self.task.detach();
            info!(query_id = %self.id(), "Query aborted");
        }
        aborted
    }

    fn abort_initiated(&self) {
        // The flag was raised while still in `Created`
        let _ = self.core.transition(PipelineState::Aborted);
        self.task.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::{ClusterNode, NodeRole};
    use crate::buffers::MeasurementType;
    use crate::pipeline::aggregator::PassCountSummary;
    use crate::pipeline::filter::{QueryFilter, SpatialFilter};
    use crate::pipeline::request::{PartitionResponse, QueryKind};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Reports every requested tile as one fully-targeted cell
    struct CountingExecutor {
        id: Uuid,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl PartitionExecutor for CountingExecutor {
        fn node_id(&self) -> Uuid {
            self.id
        }

        async fn execute(&self, request: PartitionRequest) -> QueryResult<PartitionResponse> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(QueryError::Execution("disk unavailable".to_string()));
            }
            let mut partial = request.aggregator;
            if let QueryAggregator::PassCount(_) = partial {
                let mut leaf = crate::buffers::ClientLeaf::pass_count(4);
                for index in 0..request.tiles.len().min(4) {
                    leaf.assign(index, &[crate::storage::Pass::new(1, 1.0)]);
                }
                partial.process_leaf(&leaf);
            }
            Ok(PartitionResponse {
                division: request.division,
                node: self.id,
                tiles_processed: request.tiles.len(),
                partial,
            })
        }
    }

    fn topology(partitions: u32) -> (SpatialAffinity, Vec<ClusterNode>) {
        let affinity = SpatialAffinity::new(partitions).unwrap();
        let nodes = (0..partitions)
            .map(|d| ClusterNode::new(NodeRole::Storage).with_division(d))
            .collect();
        (affinity, nodes)
    }

    fn executors(nodes: &[ClusterNode], delay: Duration, failing: Option<usize>) -> HashMap<Uuid, Arc<dyn PartitionExecutor>> {
        nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let executor: Arc<dyn PartitionExecutor> = Arc::new(CountingExecutor {
                    id: node.id,
                    delay,
                    fail: failing == Some(i),
                });
                (node.id, executor)
            })
            .collect()
    }

    fn existence(tiles: &[(u32, u32)]) -> ExistenceMap {
        let mut map = ExistenceMap::new();
        for &(x, y) in tiles {
            map.set(TileAddress::new(x, y));
        }
        map
    }

    fn pass_count_request(spatial: SpatialFilter) -> QueryRequest {
        QueryRequest::new(
            QueryFilter {
                spatial,
                ..QueryFilter::default()
            },
            QueryKind::default_for(MeasurementType::PassCount),
        )
    }

    #[test]
    fn test_initiate_prunes_and_groups() {
        let (affinity, nodes) = topology(4);
        let map = affinity.assign_partitions(&nodes);
        let pipeline = QueryPipeline::new(pass_count_request(SpatialFilter::rect(0, 0, 127, 127)), 1.0);

        let plan = pipeline
            .initiate(
                &existence(&[(0, 0), (1, 0), (3, 3), (10, 10)]),
                IndexGeometry::default(),
                &affinity,
                &map,
                |_| true,
            )
            .unwrap();

        assert_eq!(pipeline.state(), PipelineState::Initiated);
        assert_eq!(plan.tile_count(), 3);
        assert_eq!(plan.skipped_tiles, 0);
        assert!(plan.work.windows(2).all(|w| w[0].division < w[1].division));
    }

    #[test]
    fn test_initiate_skips_unroutable_division() {
        let (affinity, nodes) = topology(2);
        let map = affinity.assign_partitions(&nodes[..1]);
        let pipeline = QueryPipeline::new(pass_count_request(SpatialFilter::All), 1.0);

        // Tiles (0,0) and (4,0) fall in divisions 0 and 1
        let plan = pipeline
            .initiate(&existence(&[(0, 0), (4, 0)]), IndexGeometry::default(), &affinity, &map, |_| true)
            .unwrap();
        assert_eq!(plan.work.len(), 1);
        assert_eq!(plan.skipped_tiles, 1);
    }

    #[tokio::test]
    async fn test_run_combines_partials() {
        let (affinity, nodes) = topology(4);
        let map = affinity.assign_partitions(&nodes);
        let tiles: Vec<(u32, u32)> = (0..16).map(|i| (i * 4, 0)).collect();
        let pipeline = QueryPipeline::new(pass_count_request(SpatialFilter::All), 1.0);

        let plan = pipeline
            .initiate(&existence(&tiles), IndexGeometry::default(), &affinity, &map, |_| true)
            .unwrap();
        let response = pipeline
            .run(plan, &executors(&nodes, Duration::ZERO, None))
            .await
            .unwrap();

        let QueryResponse::PassCount(PassCountSummary { counts, .. }) = response else {
            panic!("wrong response kind")
        };
        assert_eq!(counts.cells, 16);
        assert_eq!(counts.no_target, 16);
        assert_eq!(pipeline.state(), PipelineState::Completed);
        assert_eq!(pipeline.progress(), (4, 4));
    }

    #[tokio::test]
    async fn test_partition_failure_isolated() {
        let (affinity, nodes) = topology(4);
        let map = affinity.assign_partitions(&nodes);
        let tiles: Vec<(u32, u32)> = (0..4).map(|i| (i * 4, 0)).collect();
        let pipeline = QueryPipeline::new(pass_count_request(SpatialFilter::All), 1.0);

        let plan = pipeline
            .initiate(&existence(&tiles), IndexGeometry::default(), &affinity, &map, |_| true)
            .unwrap();
        let err = pipeline
            .run(plan, &executors(&nodes, Duration::ZERO, Some(2)))
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::PartitionFailed { division: 2, .. }));
        assert_eq!(pipeline.task().accepted(), 3);
    }

    #[tokio::test]
    async fn test_abort_mid_flight() {
        let (affinity, nodes) = topology(4);
        let map = affinity.assign_partitions(&nodes);
        let tiles: Vec<(u32, u32)> = (0..4).map(|i| (i * 4, 0)).collect();
        let pipeline = QueryPipeline::new(pass_count_request(SpatialFilter::All), 1.0);

        let plan = pipeline
            .initiate(&existence(&tiles), IndexGeometry::default(), &affinity, &map, |_| true)
            .unwrap();
        let executors = executors(&nodes, Duration::from_secs(30), None);
        let runner = pipeline.clone();
        let handle = tokio::spawn(async move { runner.run(plan, &executors).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pipeline.abort());
        let result = handle.await.unwrap();

        assert!(matches!(result, Err(QueryError::Aborted)));
        assert_eq!(pipeline.state(), PipelineState::Aborted);
        assert_eq!(pipeline.task().accepted(), 0);
        assert!(!pipeline.task().is_attached());
    }
}
