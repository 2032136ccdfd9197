//! Node-local partition execution
//!
//! A compute node owns a segment store and a leaf factory. A partition
//! request's tiles are spread over a scoped pool of worker threads; each
//! worker fills pooled leaves and folds them into its own aggregator, and
//! the per-worker partials are combined before the response leaves the node.

use crate::affinity::ClusterNode;
use crate::buffers::ClientLeafFactory;
use crate::pipeline::{
    Aggregator, PartitionExecutor, PartitionRequest, PartitionResponse, QueryAggregator,
    QueryError, QueryFilter, QueryResult,
};
use crate::storage::{SegmentStore, TileAddress};
use async_trait::async_trait;
use std::sync::Arc;
use std::thread;
use tracing::debug;
use uuid::Uuid;

/// One in-process cluster member
#[derive(Debug)]
pub struct ComputeNode {
    topology: ClusterNode,
    store: SegmentStore,
    factory: Arc<ClientLeafFactory>,
    worker_threads: usize,
}

impl ComputeNode {
    pub fn new(
        topology: ClusterNode,
        store: SegmentStore,
        factory: Arc<ClientLeafFactory>,
        worker_threads: usize,
    ) -> Self {
        Self {
            topology,
            store,
            factory,
            worker_threads: worker_threads.max(1),
        }
    }

    pub fn id(&self) -> Uuid {
        self.topology.id
    }

    pub fn topology(&self) -> &ClusterNode {
        &self.topology
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn factory(&self) -> &Arc<ClientLeafFactory> {
        &self.factory
    }

    /// Run `prototype`'s aggregation over `tiles`, returning the combined
    /// partial and the number of tiles that held data
    pub fn process_tiles(
        &self,
        tiles: &[TileAddress],
        filter: &QueryFilter,
        prototype: &QueryAggregator,
    ) -> QueryResult<(QueryAggregator, usize)> {
        if tiles.is_empty() {
            return Ok((prototype.fresh(), 0));
        }
        let chunk = tiles.len().div_ceil(self.worker_threads);

        let partials: Vec<QueryResult<(QueryAggregator, usize)>> = thread::scope(|scope| {
            let workers: Vec<_> = tiles
                .chunks(chunk)
                .map(|chunk| scope.spawn(move || self.process_chunk(chunk, filter, prototype.fresh())))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker
                        .join()
                        .unwrap_or_else(|_| Err(QueryError::Execution("worker thread panicked".to_string())))
                })
                .collect()
        });

        let mut combined = prototype.fresh();
        let mut processed = 0;
        for partial in partials {
            let (partial, tiles) = partial?;
            combined = combined.combine(partial);
            processed += tiles;
        }
        Ok((combined, processed))
    }

    fn process_chunk(
        &self,
        tiles: &[TileAddress],
        filter: &QueryFilter,
        mut aggregator: QueryAggregator,
    ) -> QueryResult<(QueryAggregator, usize)> {
        let mut processed = 0;
        for &tile in tiles {
            if self.process_tile(tile, filter, &mut aggregator)? {
                processed += 1;
            }
        }
        Ok((aggregator, processed))
    }

    fn process_tile(
        &self,
        address: TileAddress,
        filter: &QueryFilter,
        aggregator: &mut QueryAggregator,
    ) -> QueryResult<bool> {
        let Some(tile) = self.store.locate(address) else {
            return Ok(false);
        };
        let geometry = self.store.geometry();
        let mut leaf = self.factory.acquire(aggregator.measurement_type())?;
        leaf.set_origin(address);

        {
            let segments = tile.lock();
            for cell_index in 0..geometry.cells_per_tile() {
                let cell = geometry.cell_address(address, geometry.cell_at(cell_index));
                if !filter.spatial.contains(cell) {
                    continue;
                }
                let passes = segments
                    .passes_for(cell_index, filter.time.range)
                    .filter(|pass| filter.attribute.matches(pass));
                leaf.assign(cell_index, passes);
            }
        }

        aggregator.process_leaf(&leaf);
        self.factory.release(leaf);
        Ok(true)
    }
}

#[async_trait]
impl PartitionExecutor for Arc<ComputeNode> {
    fn node_id(&self) -> Uuid {
        self.id()
    }

    async fn execute(&self, request: PartitionRequest) -> QueryResult<PartitionResponse> {
        let node = Arc::clone(self);
        let division = request.division;
        let tiles = request.tiles.len();
        let (partial, tiles_processed) = tokio::task::spawn_blocking(move || {
            node.process_tiles(&request.tiles, &request.filter, &request.aggregator)
        })
        .await
        .map_err(|err| QueryError::Execution(err.to_string()))??;

        debug!(
            node = %self.id(),
            division,
            tiles,
            tiles_processed,
            "Partition executed"
        );
        Ok(PartitionResponse {
            division,
            node: self.id(),
            partial,
            tiles_processed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::NodeRole;
    use crate::buffers::MeasurementType;
    use crate::pipeline::{AttributeFilter, QueryKind, QueryResponse, SpatialFilter, TimeFilter};
    use crate::storage::{CellCoord, MemoryTier, Pass, StoreConfig};

    fn node(workers: usize) -> Arc<ComputeNode> {
        let store = SegmentStore::new(StoreConfig::default(), Arc::new(MemoryTier::new()));
        Arc::new(ComputeNode::new(
            ClusterNode::new(NodeRole::Storage).with_division(0),
            store,
            Arc::new(ClientLeafFactory::with_defaults(1024, 16)),
            workers,
        ))
    }

    fn filter() -> QueryFilter {
        QueryFilter::new(SpatialFilter::All, TimeFilter::all(), AttributeFilter::new())
    }

    #[test]
    fn test_workers_combine_to_single_result() {
        let node = node(3);
        let tiles: Vec<TileAddress> = (0..7).map(|x| TileAddress::new(x, 0)).collect();
        for tile in &tiles {
            for t in 0..3 {
                node.store()
                    .append(*tile, CellCoord::new(1, 1), Pass::new(t, 2.0 + t as f32))
                    .unwrap();
            }
        }

        let prototype = QueryKind::default_for(MeasurementType::Height).aggregator(1.0);
        let (partial, processed) = node
            .process_tiles(&tiles, &filter(), &prototype)
            .unwrap();
        let QueryResponse::Elevation(stats) = partial.finalize() else { panic!("wrong response") };

        assert_eq!(processed, 7);
        assert_eq!(stats.cells, 7);
        assert_eq!(stats.max_height, Some(4.0));
        // Every leaf went back to the pool
        let factory = node.factory().stats();
        assert_eq!(factory.released, factory.constructed + factory.reused);
    }

    #[test]
    fn test_missing_tiles_are_not_processed() {
        let node = node(2);
        let prototype = QueryKind::default_for(MeasurementType::PassCount).aggregator(1.0);
        let (_, processed) = node
            .process_tiles(&[TileAddress::new(5, 5)], &filter(), &prototype)
            .unwrap();
        assert_eq!(processed, 0);
    }

    #[tokio::test]
    async fn test_execute_applies_filters() {
        let node = node(2);
        let tile = TileAddress::new(0, 0);
        node.store().append(tile, CellCoord::new(0, 0), Pass::new(10, 1.0).machine(1)).unwrap();
        node.store().append(tile, CellCoord::new(0, 0), Pass::new(20, 1.0).machine(2)).unwrap();
        node.store().append(tile, CellCoord::new(0, 1), Pass::new(30, 1.0).machine(1)).unwrap();

        let filter = QueryFilter::new(
            SpatialFilter::rect(0, 0, 0, 0),
            TimeFilter::between(0, 25),
            AttributeFilter::new().machines([1]),
        );
        let request = PartitionRequest {
            query_id: Uuid::new_v4(),
            division: 0,
            tiles: vec![tile],
            filter,
            aggregator: QueryKind::default_for(MeasurementType::PassCount).aggregator(1.0),
        };
        let response = node.execute(request).await.unwrap();
        let QueryResponse::PassCount(summary) = response.partial.finalize() else {
            panic!("wrong response")
        };

        assert_eq!(response.node, node.id());
        assert_eq!(summary.counts.cells, 1);
        assert_eq!(summary.total_passes, 1);
    }
}
