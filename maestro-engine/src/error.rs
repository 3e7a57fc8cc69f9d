// Engine error types
// Runtime failures that bubble up to the run loop

use crate::score::ConfigError;

use thiserror::Error;

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while executing a piece
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Report phase failed: {file}: {reason}")]
    ReportPhase { file: String, reason: String },

    #[error("Status phase failed for movement '{movement}': {reason}")]
    StatusPhase { movement: String, reason: String },

    #[error("no rule matched the output of movement '{movement}'")]
    NoRuleMatched { movement: String },

    #[error("decomposition failed: {0}")]
    Decomposition(String),

    #[error("all {} parts failed: {}", .ids.len(), .ids.join(", "))]
    AllPartsFailed { ids: Vec<String> },

    #[error("all parallel sub-movements failed: {0}")]
    AllBranchesFailed(String),

    #[error("batch {index} failed after {attempts} attempts: {reason}")]
    BatchFailed {
        index: usize,
        attempts: u32,
        reason: String,
    },

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("row source error: {0}")]
    RowSource(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
