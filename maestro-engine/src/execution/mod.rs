// Execution Module
// The run loop, the three-phase movement protocol and its detection machinery

pub mod detect;
pub mod engine;
pub mod events;
pub mod movement;
pub mod rules;
pub mod state;

// Re-export key types
pub use detect::{CycleDetector, LoopDetector, LoopVerdict, CYCLE_JUDGE};
pub use engine::{AbortHandle, Engine, PieceResult};
pub use events::{progress_channel, EventSender, Phase, PieceEvent, ProgressReceiver, ProgressSender};
pub use movement::{MovementExecutor, MovementOutcome};
pub use rules::{RegexTagDetector, RuleEvaluator, RuleMatch, TagDetector};
pub use state::{PieceState, PieceStatus};
