// Score Module
// Piece configuration models and construction-time validation

pub mod models;
pub mod validate;

pub use models::{
    is_terminal, render, ArpeggioSpec, CycleMonitor, JudgeSpec, LoopThresholds, MergeStrategy,
    Movement, ParallelSpec, PieceConfig, Rule, SubMovement, TeamLeaderSpec, ABORT, COMPLETE,
};
pub use validate::{validate, ConfigError, ConfigErrorKind};
