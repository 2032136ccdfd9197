//! Response intake for one query
//!
//! The [`Task`] is the only way partition responses reach a pipeline's
//! aggregator. It holds an optional reference to the pipeline; aborting the
//! pipeline clears that reference under the same lock that guards intake,
//! so once an abort has been observed no further partial is merged.

use crate::pipeline::aggregator::{Aggregator, QueryAggregator};
use crate::pipeline::error::{QueryError, QueryResult};
use crate::pipeline::request::PartitionResponse;
use crate::pipeline::state::PipelineState;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Shared state of a running query
#[derive(Debug)]
pub(crate) struct PipelineCore {
    query_id: Uuid,
    state: Mutex<PipelineState>,
    aborted: AtomicBool,
    aggregator: Mutex<Option<QueryAggregator>>,
    expected: AtomicUsize,
    received: AtomicUsize,
    abort_notify: Notify,
}

impl PipelineCore {
    pub(crate) fn new(query_id: Uuid, aggregator: QueryAggregator) -> Self {
        Self {
            query_id,
            state: Mutex::new(PipelineState::Created),
            aborted: AtomicBool::new(false),
            aggregator: Mutex::new(Some(aggregator)),
            expected: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            abort_notify: Notify::new(),
        }
    }

    pub(crate) fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub(crate) fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub(crate) fn transition(&self, to: PipelineState) -> QueryResult<()> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(QueryError::InvalidTransition { from, to });
        }
        *state = to;
        debug!(query_id = %self.query_id, %from, %to, "Pipeline transition");
        Ok(())
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Raise the abort flag. Returns false when the query had already
    /// finished or been aborted.
    pub(crate) fn abort(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() || self.aborted.swap(true, Ordering::AcqRel) {
            return false;
        }
        if state.can_transition_to(PipelineState::Aborted) {
            *state = PipelineState::Aborted;
        }
        drop(state);
        // Stores a permit when nobody is waiting yet
        self.abort_notify.notify_one();
        true
    }

    pub(crate) async fn aborted(&self) {
        self.abort_notify.notified().await;
    }

    pub(crate) fn set_expected(&self, expected: usize) {
        self.expected.store(expected, Ordering::Release);
    }

    /// `(received, expected)` partition responses
    pub(crate) fn progress(&self) -> (usize, usize) {
        (
            self.received.load(Ordering::Acquire),
            self.expected.load(Ordering::Acquire),
        )
    }

    fn accept(&self, partial: QueryAggregator) -> bool {
        let mut aggregator = self.aggregator.lock();
        match aggregator.as_mut() {
            Some(aggregator) => {
                aggregator.process_partial(partial);
                self.received.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Take the accumulated result; later partials are refused
    pub(crate) fn take_aggregator(&self) -> Option<QueryAggregator> {
        self.aggregator.lock().take()
    }
}

/// Receives partition responses for a pipeline
#[derive(Debug)]
pub struct Task {
    query_id: Uuid,
    pipeline: Mutex<Option<Arc<PipelineCore>>>,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
}

impl Task {
    pub(crate) fn new(core: Arc<PipelineCore>) -> Self {
        Self {
            query_id: core.query_id(),
            pipeline: Mutex::new(Some(core)),
            accepted: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Hand one partition response to the pipeline's aggregator.
    ///
    /// Returns false, after logging, when the pipeline has been aborted or
    /// detached; that is never an error.
    pub fn transfer_response(&self, response: PartitionResponse) -> bool {
        let pipeline = self.pipeline.lock();
        let core = match pipeline.as_ref() {
            Some(core) if !core.is_aborted() => core,
            _ => {
                warn!(
                    query_id = %self.query_id,
                    division = response.division,
                    "Discarding response for aborted query"
                );
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        if !core.accept(response.partial) {
            warn!(
                query_id = %self.query_id,
                division = response.division,
                "Discarding response after finalize"
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(
            query_id = %self.query_id,
            division = response.division,
            node = %response.node,
            tiles = response.tiles_processed,
            "Accepted partition response"
        );

        // Tell the caller to stop feeding us
        !core.is_aborted()
    }

    /// Transfer responses in order, stopping at the first refusal.
    /// Returns how many were accepted.
    pub fn transfer_responses(&self, responses: impl IntoIterator<Item = PartitionResponse>) -> usize {
        let mut transferred = 0;
        for response in responses {
            let before = self.accepted();
            let keep_going = self.transfer_response(response);
            if self.accepted() > before {
                transferred += 1;
            }
            if !keep_going {
                break;
            }
        }
        transferred
    }

    /// Drop the pipeline reference; waits for an in-progress transfer
    pub(crate) fn detach(&self) {
        self.pipeline.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.pipeline.lock().is_some()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::aggregator::{ElevationStatisticsAggregator, QueryResponse};

    fn response(division: u32) -> PartitionResponse {
        PartitionResponse {
            division,
            node: Uuid::new_v4(),
            partial: QueryAggregator::Elevation(ElevationStatisticsAggregator::new(1.0)),
            tiles_processed: 1,
        }
    }

    fn core() -> Arc<PipelineCore> {
        Arc::new(PipelineCore::new(
            Uuid::new_v4(),
            QueryAggregator::Elevation(ElevationStatisticsAggregator::new(1.0)),
        ))
    }

    #[test]
    fn test_transfer_until_abort() {
        let core = core();
        let task = Task::new(Arc::clone(&core));
        core.transition(PipelineState::Initiated).unwrap();
        core.transition(PipelineState::Running).unwrap();

        assert!(task.transfer_response(response(0)));
        assert!(core.abort());
        assert_eq!(core.state(), PipelineState::Aborted);
        assert!(!task.transfer_response(response(1)));

        assert_eq!(task.accepted(), 1);
        assert_eq!(task.rejected(), 1);
        assert_eq!(core.progress().0, 1);
    }

    #[test]
    fn test_detached_task_is_noop() {
        let core = core();
        let task = Task::new(Arc::clone(&core));
        task.detach();
        assert!(!task.is_attached());
        assert_eq!(task.transfer_responses(vec![response(0), response(1)]), 0);
        assert_eq!(core.progress().0, 0);
    }

    #[test]
    fn test_refused_after_finalize() {
        let core = core();
        let task = Task::new(Arc::clone(&core));
        assert_eq!(task.transfer_responses(vec![response(0), response(1)]), 2);

        let result = core.take_aggregator().unwrap().finalize();
        assert!(matches!(result, QueryResponse::Elevation(_)));
        assert!(!task.transfer_response(response(2)));
    }

    #[test]
    fn test_abort_once() {
        let core = core();
        core.transition(PipelineState::Initiated).unwrap();
        assert!(core.abort());
        assert!(!core.abort());
        assert!(core.transition(PipelineState::Running).is_err());
    }
}
