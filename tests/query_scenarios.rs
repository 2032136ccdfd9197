//! End-to-end query scenarios against the in-process cluster

use async_trait::async_trait;
use groundwork::affinity::{ClusterNode, NodeRole, SpatialAffinity};
use groundwork::pipeline::{
    AttributeFilter, PartitionExecutor, PartitionRequest, PartitionResponse, PipelineState,
    QueryError, QueryFilter, QueryKind, QueryRequest, QueryResponse, QueryResult, QueryService,
    SpatialFilter, TimeFilter,
};
use groundwork::storage::{CellCoord, Pass, PassEvents, TileAddress};
use groundwork::{Cluster, ClusterConfig, MeasurementType};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Delays before handing the request to the real node
struct SlowExecutor {
    inner: Arc<dyn PartitionExecutor>,
    delay: Duration,
}

#[async_trait]
impl PartitionExecutor for SlowExecutor {
    fn node_id(&self) -> Uuid {
        self.inner.node_id()
    }

    async fn execute(&self, request: PartitionRequest) -> QueryResult<PartitionResponse> {
        tokio::time::sleep(self.delay).await;
        self.inner.execute(request).await
    }
}

struct FailingExecutor {
    id: Uuid,
}

#[async_trait]
impl PartitionExecutor for FailingExecutor {
    fn node_id(&self) -> Uuid {
        self.id
    }

    async fn execute(&self, _request: PartitionRequest) -> QueryResult<PartitionResponse> {
        Err(QueryError::Execution("segment blob unreadable".to_string()))
    }
}

/// One tile per division, 4 populated cells per tile
fn populated_cluster(partitions: u32, replicas: u32) -> Arc<Cluster> {
    let cluster = Cluster::new(ClusterConfig {
        partition_count: partitions,
        replicas,
        worker_threads: 2,
        ..ClusterConfig::default()
    })
    .unwrap();
    let events = PassEvents {
        target_pass_count: 3,
        target_cmv: 400,
        ..PassEvents::default()
    };
    for division in 0..partitions {
        let tile = TileAddress::new(division * 4, 0);
        for cell in 0..4u16 {
            for t in 0..=cell as i64 {
                let pass = Pass::new(1_000 + t * 100, 20.0 + cell as f32)
                    .machine(cell % 2)
                    .cmv(300 + cell as i16 * 50)
                    .events(events);
                cluster.append(tile, CellCoord::new(cell, 0), pass).unwrap();
            }
        }
    }
    Arc::new(cluster)
}

fn pass_count_request() -> QueryRequest {
    QueryRequest::new(
        QueryFilter::default(),
        QueryKind::default_for(MeasurementType::PassCount),
    )
}

#[test]
fn test_eight_partitions_five_nodes() {
    let affinity = SpatialAffinity::new(8).unwrap();
    let nodes: Vec<ClusterNode> = [0, 2, 3, 4, 1]
        .into_iter()
        .map(|d| ClusterNode::new(NodeRole::Storage).with_division(d))
        .collect();

    let map = affinity.assign_partitions(&nodes);
    assert_eq!(map.uncovered(), vec![5, 6, 7]);
    for division in 0..5 {
        assert_eq!(map.nodes_for(division).len(), 1);
        assert!(map.primary(division).is_some());
    }
}

#[tokio::test]
async fn test_pass_count_summary_across_divisions() {
    let cluster = populated_cluster(4, 1);
    let service = QueryService::new(cluster);

    let handle = service.submit(pass_count_request()).unwrap();
    let QueryResponse::PassCount(summary) = service.await_result(handle).await.unwrap() else {
        panic!("wrong response kind")
    };

    // Per tile: cells hold 1, 2, 3 and 4 passes against a target of 3
    assert_eq!(summary.counts.cells, 16);
    assert_eq!(summary.counts.below, 8);
    assert_eq!(summary.counts.within, 4);
    assert_eq!(summary.counts.above, 4);
    assert_eq!(summary.total_passes, 40);
    assert_eq!(summary.target, Some(3));
    assert!(summary.target_constant);
}

#[tokio::test]
async fn test_filters_narrow_results() {
    let cluster = populated_cluster(4, 1);
    let service = QueryService::new(cluster);

    // Only the first tile, machine 1, passes before t = 1_150
    let handle = service
        .submit_query(
            SpatialFilter::rect(0, 0, 31, 31),
            TimeFilter::between(0, 1_150),
            AttributeFilter::new().machines([1]),
            MeasurementType::PassCount,
        )
        .unwrap();
    let QueryResponse::PassCount(summary) = service.await_result(handle).await.unwrap() else {
        panic!("wrong response kind")
    };
    // Cells 1 and 3 belong to machine 1; each has two passes before 1_150
    assert_eq!(summary.counts.cells, 2);
    assert_eq!(summary.total_passes, 4);

    let handle = service
        .submit(QueryRequest::new(
            QueryFilter::new(
                SpatialFilter::All,
                TimeFilter::all(),
                AttributeFilter::new().elevation(21.5, 30.0),
            ),
            QueryKind::ElevationStatistics,
        ))
        .unwrap();
    let QueryResponse::Elevation(stats) = service.await_result(handle).await.unwrap() else {
        panic!("wrong response kind")
    };
    assert_eq!(stats.cells, 8);
    assert_eq!(stats.min_height, Some(22.0));
    assert_eq!(stats.max_height, Some(23.0));
}

#[tokio::test]
async fn test_cancel_mid_flight_discards_late_partials() {
    let cluster = populated_cluster(4, 1);
    let map = cluster.partition_map();
    for division in 2..4 {
        let id = map.primary(division).unwrap();
        let inner = cluster.executors()[&id].clone();
        cluster
            .replace_executor(
                id,
                Arc::new(SlowExecutor {
                    inner,
                    delay: Duration::from_millis(300),
                }),
            )
            .unwrap();
    }
    let service = QueryService::new(Arc::clone(&cluster));

    let handle = service.submit(pass_count_request()).unwrap();
    let pipeline = service.pipeline(handle).unwrap();
    for _ in 0..200 {
        if pipeline.progress().0 == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pipeline.progress().0, 2);

    assert!(service.cancel(handle));
    assert!(matches!(service.await_result(handle).await, Err(QueryError::Aborted)));
    assert_eq!(pipeline.state(), PipelineState::Aborted);

    // Let the slow partitions finish; nothing more may be merged
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pipeline.task().accepted(), 2);
    assert_eq!(pipeline.progress().0, 2);
    assert!(!service.cancel(handle));
}

#[tokio::test]
async fn test_failover_to_backup_node() {
    let cluster = populated_cluster(4, 2);
    let service = QueryService::new(Arc::clone(&cluster));

    let handle = service.submit(pass_count_request()).unwrap();
    let QueryResponse::PassCount(before) = service.await_result(handle).await.unwrap() else {
        panic!("wrong response kind")
    };

    let map = cluster.partition_map();
    let primary = map.primary(1).unwrap();
    let backup = map.backups(1)[0];
    cluster.mark_down(primary).unwrap();
    // A failing executor on the downed node must never be reached
    cluster
        .replace_executor(primary, Arc::new(FailingExecutor { id: primary }))
        .unwrap();
    assert!(cluster.node(backup).unwrap().store().has_data(TileAddress::new(4, 0)));

    let handle = service.submit(pass_count_request()).unwrap();
    let QueryResponse::PassCount(after) = service.await_result(handle).await.unwrap() else {
        panic!("wrong response kind")
    };
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_partition_failure_does_not_stop_siblings() {
    let cluster = populated_cluster(4, 1);
    let failing = cluster.partition_map().primary(1).unwrap();
    cluster
        .replace_executor(failing, Arc::new(FailingExecutor { id: failing }))
        .unwrap();
    let service = QueryService::new(Arc::clone(&cluster));

    let handle = service.submit(pass_count_request()).unwrap();
    let pipeline = service.pipeline(handle).unwrap();
    let err = service.await_result(handle).await.unwrap_err();

    assert!(matches!(err, QueryError::PartitionFailed { division: 1, .. }));
    assert_eq!(err.code(), 500);
    assert_eq!(pipeline.task().accepted(), 3);
}

#[tokio::test]
async fn test_uncovered_division_returns_partial_data() {
    let cluster = populated_cluster(4, 1);
    let primary = cluster.partition_map().primary(3).unwrap();
    cluster.remove_node(primary).unwrap();
    let service = QueryService::new(cluster);

    let handle = service.submit(pass_count_request()).unwrap();
    let QueryResponse::PassCount(summary) = service.await_result(handle).await.unwrap() else {
        panic!("wrong response kind")
    };
    assert_eq!(summary.counts.cells, 12);
}
