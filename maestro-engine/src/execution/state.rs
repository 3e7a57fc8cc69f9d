// Piece State
// Mutable run state, owned exclusively by the engine's control flow

use crate::agent::AgentResponse;

use std::collections::HashMap;

/// Lifecycle status of a running piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Running,
    Completed,
    Aborted,
}

/// State of one piece run.
///
/// Created once at engine construction and mutated only by the single
/// logical control flow driving the run loop; fan-out results are merged
/// back by their owner after every branch has settled.
#[derive(Debug, Clone)]
pub struct PieceState {
    pub status: PieceStatus,
    /// Global iteration counter
    pub iteration: u32,
    /// Per-movement iteration counters
    pub movement_iterations: HashMap<String, u32>,
    /// Name of the movement the next pass runs
    pub current: String,
    /// Last response per movement
    pub responses: HashMap<String, AgentResponse>,
    /// Session ids keyed by session key
    pub sessions: HashMap<String, String>,
    /// Content of the most recent response
    pub last_output: String,
    /// User inputs accumulated across the run
    pub user_inputs: Vec<String>,
}

impl PieceState {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            status: PieceStatus::Running,
            iteration: 0,
            movement_iterations: HashMap::new(),
            current: initial.into(),
            responses: HashMap::new(),
            sessions: HashMap::new(),
            last_output: String::new(),
            user_inputs: Vec::new(),
        }
    }

    /// Record a settled response for a movement
    pub fn record_response(&mut self, response: AgentResponse) {
        self.last_output = response.content.clone();
        self.responses.insert(response.movement.clone(), response);
    }

    /// Count one more pass through `movement`, returning the new per-movement total
    pub fn count_iteration(&mut self, movement: &str) -> u32 {
        self.iteration += 1;
        let counter = self
            .movement_iterations
            .entry(movement.to_string())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn session_for(&self, key: &str) -> Option<String> {
        self.sessions.get(key).cloned()
    }
}
