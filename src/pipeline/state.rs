//! Query pipeline lifecycle

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one query execution
///
/// ```text
/// Created ──► Initiated ──► Running ──► Completed
///                 │            │
///                 └────────────┴──────► Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Created,
    /// Work list built and routed
    Initiated,
    /// Partition requests dispatched, responses arriving
    Running,
    Completed,
    Aborted,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Created, Initiated)
                | (Initiated, Running)
                | (Running, Completed)
                | (Initiated, Aborted)
                | (Running, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Aborted)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Created => "created",
            PipelineState::Initiated => "initiated",
            PipelineState::Running => "running",
            PipelineState::Completed => "completed",
            PipelineState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}
