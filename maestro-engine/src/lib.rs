// Maestro Engine Library
// Execution engine for declarative multi-step AI-agent workflows

pub mod agent;
pub mod cancel;
pub mod error;
pub mod execution;
pub mod host;
pub mod runners;
pub mod score;
pub mod session;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};

// Re-export agent interfaces
pub use agent::{
    AgentCall, AgentEvent, AgentEventSender, AgentResponse, AgentStatus, CallOptions, JudgeCall,
    MatchMethod,
};

// Re-export score types
pub use score::{
    validate, ArpeggioSpec, ConfigError, ConfigErrorKind, CycleMonitor, JudgeSpec, LoopThresholds,
    MergeStrategy, Movement, ParallelSpec, PieceConfig, Rule, SubMovement, TeamLeaderSpec, ABORT,
    COMPLETE,
};

// Re-export execution types
pub use execution::{
    progress_channel, AbortHandle, Engine, EventSender, Phase, PieceEvent, PieceResult, PieceState,
    PieceStatus, ProgressReceiver, ProgressSender, RuleEvaluator, TagDetector,
};

// Re-export runner types
pub use runners::{
    ArpeggioRunner, BatchOutcome, FileRowSource, MemoryRowSource, MergeFn, ParallelRunner,
    PartDefinition, PartResult, RowSource, TeamLeaderRunner,
};

// Re-export utilities
pub use cancel::{CancelReason, CancelToken};
pub use host::{HostCallbacks, NullHost};
pub use session::{branch_session_key, session_key};
