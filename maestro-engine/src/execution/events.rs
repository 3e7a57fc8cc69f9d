// Piece Events
// Progress reporting for host UI, logging and persistence; never consumed internally

use crate::agent::AgentStatus;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for piece progress events
pub type ProgressSender = mpsc::UnboundedSender<PieceEvent>;

/// Receiver for piece progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<PieceEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Sub-step of one movement run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Phase 1: execute the instruction
    Execute,
    /// Phase 2: collect named report outputs
    Report,
    /// Phase 3: request the decision tag
    StatusJudgment,
}

/// Events emitted while a piece runs
#[derive(Debug, Clone)]
pub enum PieceEvent {
    /// A movement began executing
    MovementStart {
        movement: String,
        persona: String,
        iteration: u32,
    },

    /// A movement settled
    MovementComplete {
        movement: String,
        status: AgentStatus,
        matched_rule: Option<usize>,
        duration: Duration,
    },

    /// A named report output was collected in Phase 2
    MovementReport {
        movement: String,
        file: String,
        content: String,
    },

    /// The same-movement streak crossed a threshold
    MovementLoopDetected {
        movement: String,
        streak: u32,
        hard: bool,
    },

    /// A cycle monitor reached its repeat threshold
    MovementCycleDetected { cycle: Vec<String>, repeats: u32 },

    /// User input was accepted and appended for the next pass
    MovementUserInput { movement: String, input: String },

    /// A movement reported blocked and was routed to the host
    MovementBlocked { movement: String, content: String },

    /// A phase of the three-phase protocol started
    PhaseStart { movement: String, phase: Phase },

    /// A phase of the three-phase protocol settled
    PhaseComplete {
        movement: String,
        phase: Phase,
        status: AgentStatus,
    },

    /// The piece completed
    PieceComplete {
        piece: String,
        iterations: u32,
        duration: Duration,
    },

    /// The piece aborted
    PieceAbort {
        piece: String,
        reason: String,
        iterations: u32,
    },

    /// The global iteration cap was hit and the host was asked for budget
    IterationLimit { used: u32, cap: u32 },
}

impl PieceEvent {
    pub fn movement_start(
        movement: impl Into<String>,
        persona: impl Into<String>,
        iteration: u32,
    ) -> Self {
        Self::MovementStart {
            movement: movement.into(),
            persona: persona.into(),
            iteration,
        }
    }

    pub fn movement_complete(
        movement: impl Into<String>,
        status: AgentStatus,
        matched_rule: Option<usize>,
        duration: Duration,
    ) -> Self {
        Self::MovementComplete {
            movement: movement.into(),
            status,
            matched_rule,
            duration,
        }
    }

    pub fn movement_report(
        movement: impl Into<String>,
        file: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::MovementReport {
            movement: movement.into(),
            file: file.into(),
            content: content.into(),
        }
    }

    pub fn phase_start(movement: impl Into<String>, phase: Phase) -> Self {
        Self::PhaseStart {
            movement: movement.into(),
            phase,
        }
    }

    pub fn phase_complete(movement: impl Into<String>, phase: Phase, status: AgentStatus) -> Self {
        Self::PhaseComplete {
            movement: movement.into(),
            phase,
            status,
        }
    }

    pub fn piece_complete(piece: impl Into<String>, iterations: u32, duration: Duration) -> Self {
        Self::PieceComplete {
            piece: piece.into(),
            iterations,
            duration,
        }
    }

    pub fn piece_abort(piece: impl Into<String>, reason: impl Into<String>, iterations: u32) -> Self {
        Self::PieceAbort {
            piece: piece.into(),
            reason: reason.into(),
            iterations,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: PieceEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: PieceEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: PieceEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
