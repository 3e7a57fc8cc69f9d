// Score Validation
// Construction-time checks so no rule or monitor can resolve to a missing movement

use crate::score::models::{is_terminal, PieceConfig, Rule};

use std::collections::HashSet;
use std::fmt;

/// Error type for piece configuration problems
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub kind: ConfigErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// A rule or monitor references a movement that does not exist
    UnknownMovement,
    /// Two movements share a name
    DuplicateMovement,
    /// Structurally invalid piece (empty cycles, multiple fan-out specs, ...)
    InvalidStructure,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn unknown_movement(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ConfigErrorKind::UnknownMovement,
        }
    }

    pub fn duplicate_movement(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ConfigErrorKind::DuplicateMovement,
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ConfigErrorKind::InvalidStructure,
        }
    }
}

/// Validate a piece once, before the engine becomes runnable.
///
/// Checks movement-name uniqueness, the initial movement, every rule target,
/// every cycle-monitor movement reference and every judge-rule target.
pub fn validate(config: &PieceConfig) -> Result<(), ConfigError> {
    if config.movements.is_empty() {
        return Err(ConfigError::invalid_structure("piece has no movements"));
    }

    let mut names: HashSet<&str> = HashSet::new();
    for movement in &config.movements {
        if !names.insert(movement.name.as_str()) {
            return Err(ConfigError::duplicate_movement(format!(
                "movement '{}' is declared more than once",
                movement.name
            )));
        }
    }

    if !names.contains(config.initial.as_str()) {
        return Err(ConfigError::unknown_movement(format!(
            "initial movement '{}' does not exist",
            config.initial
        )));
    }

    for movement in &config.movements {
        if movement.fan_out_count() > 1 {
            return Err(ConfigError::invalid_structure(format!(
                "movement '{}' declares more than one fan-out spec",
                movement.name
            )));
        }

        if movement.rules.is_empty() {
            return Err(ConfigError::invalid_structure(format!(
                "movement '{}' has no rules; every movement needs at least one transition",
                movement.name
            )));
        }

        check_rules(&movement.rules, &names, &format!("movement '{}'", movement.name))?;
    }

    for (i, monitor) in config.cycle_monitors.iter().enumerate() {
        if monitor.cycle.is_empty() {
            return Err(ConfigError::invalid_structure(format!(
                "cycle monitor #{i} has an empty cycle"
            )));
        }
        if monitor.threshold == 0 {
            return Err(ConfigError::invalid_structure(format!(
                "cycle monitor #{i} has a zero threshold"
            )));
        }

        for name in &monitor.cycle {
            if !names.contains(name.as_str()) {
                return Err(ConfigError::unknown_movement(format!(
                    "cycle monitor #{i} references unknown movement '{name}'"
                )));
            }
        }

        if let Some(judge) = &monitor.judge {
            if judge.rules.is_empty() {
                return Err(ConfigError::invalid_structure(format!(
                    "cycle monitor #{i} judge has no rules"
                )));
            }
            check_rules(&judge.rules, &names, &format!("cycle monitor #{i} judge"))?;
        }
    }

    Ok(())
}

fn check_rules(
    rules: &[Rule],
    names: &HashSet<&str>,
    owner: &str,
) -> Result<(), ConfigError> {
    for rule in rules {
        if !is_terminal(&rule.next) && !names.contains(rule.next.as_str()) {
            return Err(ConfigError::unknown_movement(format!(
                "{owner} routes to unknown movement '{}'",
                rule.next
            )));
        }
    }
    Ok(())
}
