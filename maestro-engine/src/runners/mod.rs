// Fan-Out Runners
// The three fan-out strategies; each settles into one aggregate response

mod arpeggio;
mod parallel;
mod team_leader;

pub use arpeggio::{
    ArpeggioRunner, BatchOutcome, FileRowSource, MemoryRowSource, MergeFn, RowSource,
};
pub use parallel::ParallelRunner;
pub use team_leader::{PartDefinition, PartResult, TeamLeaderRunner};

use crate::agent::AgentResponse;

/// Settled result of a movement dispatch, fan-out or plain
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Aggregate response for the parent movement
    pub response: AgentResponse,
    /// Session-key -> session-id updates to merge back into piece state
    pub session_updates: Vec<(String, String)>,
}

impl DispatchOutcome {
    pub fn new(response: AgentResponse) -> Self {
        Self {
            response,
            session_updates: Vec::new(),
        }
    }
}
