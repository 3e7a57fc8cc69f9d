// Score Models
// Configuration model for pieces, movements, rules and fan-out specs

use serde::{Deserialize, Serialize};

use std::collections::HashMap;

/// Terminal marker: the piece finished successfully
pub const COMPLETE: &str = "COMPLETE";

/// Terminal marker: the piece should stop with an aborted status
pub const ABORT: &str = "ABORT";

/// Check whether a rule target is a terminal marker rather than a movement name
pub fn is_terminal(target: &str) -> bool {
    target == COMPLETE || target == ABORT
}

/// A piece: a named graph of movements connected by conditional rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceConfig {
    /// Piece name (also the session-key namespace)
    pub name: String,
    /// All movements, in declaration order
    pub movements: Vec<Movement>,
    /// Name of the movement the run starts at
    pub initial: String,
    /// Hard iteration cap; may be raised at runtime by the host callback
    #[serde(default = "default_max_movements")]
    pub max_movements: u32,
    /// Optional same-movement streak thresholds
    #[serde(default)]
    pub loop_detection: Option<LoopThresholds>,
    /// Optional repeating-cycle monitors
    #[serde(default)]
    pub cycle_monitors: Vec<CycleMonitor>,
    /// Variables available to instruction templates via `{{name}}`
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

fn default_max_movements() -> u32 {
    50
}

impl PieceConfig {
    /// Look up a movement by name
    pub fn movement(&self, name: &str) -> Option<&Movement> {
        self.movements.iter().find(|m| m.name == name)
    }
}

/// One named node in a piece's transition graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movement {
    /// Unique movement name (also the decision-tag label)
    pub name: String,
    /// Persona the agent call runs under
    pub persona: String,
    /// Ordered rules evaluated against this movement's output
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Instruction template
    #[serde(default)]
    pub instruction: String,
    /// Fixed concurrent sub-movement fan-out
    #[serde(default)]
    pub parallel: Option<ParallelSpec>,
    /// Dynamic decomposition fan-out
    #[serde(default)]
    pub team_leader: Option<TeamLeaderSpec>,
    /// Data-driven batch fan-out
    #[serde(default)]
    pub arpeggio: Option<ArpeggioSpec>,
    /// Tool allow-list override for the agent call
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    /// Permission-mode override for the agent call
    #[serde(default)]
    pub permission_mode: Option<String>,
    /// Provider override
    #[serde(default)]
    pub provider: Option<String>,
    /// Model override
    #[serde(default)]
    pub model: Option<String>,
    /// Max-turn cap for the agent call
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Named report outputs; these double as output-contract files
    #[serde(default)]
    pub reports: Vec<String>,
    /// Allow write-capable tools even when report outputs are declared
    #[serde(default)]
    pub edit: bool,
    /// Start a fresh session instead of resuming the stored one
    #[serde(default)]
    pub fresh_session: bool,
    /// Fixed per-call timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Movement {
    /// Number of fan-out specs declared (valid movements have at most one)
    pub fn fan_out_count(&self) -> usize {
        usize::from(self.parallel.is_some())
            + usize::from(self.team_leader.is_some())
            + usize::from(self.arpeggio.is_some())
    }
}

/// A condition -> next-movement edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Condition text: literal/regex, or a semantic description when `judge` is set
    pub condition: String,
    /// Judge-typed condition, matched by the judge interface rather than text
    #[serde(default)]
    pub judge: bool,
    /// Next movement name, or a terminal marker (COMPLETE/ABORT)
    pub next: String,
    /// Ask the host for input and re-run the movement before advancing
    #[serde(default)]
    pub requires_user_input: bool,
}

impl Rule {
    /// Convenience constructor for plain text rules
    pub fn text(condition: impl Into<String>, next: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            judge: false,
            next: next.into(),
            requires_user_input: false,
        }
    }
}

/// Same-movement streak thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoopThresholds {
    /// Streak length that emits a warning event
    #[serde(default = "default_warn")]
    pub warn: u32,
    /// Streak length that hard-aborts the piece
    #[serde(default = "default_abort")]
    pub abort: u32,
}

fn default_warn() -> u32 {
    3
}

fn default_abort() -> u32 {
    5
}

impl Default for LoopThresholds {
    fn default() -> Self {
        Self {
            warn: default_warn(),
            abort: default_abort(),
        }
    }
}

/// Fixed list of named sub-movements executed concurrently
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSpec {
    pub movements: Vec<SubMovement>,
}

/// One branch of a parallel fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubMovement {
    pub name: String,
    pub persona: String,
    pub instruction: String,
}

/// Dynamic decomposition fan-out: a leader call splits the work into parts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamLeaderSpec {
    /// Hard cap on the number of parts the leader may produce
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,
    /// Timeout applied to parts that do not declare their own
    #[serde(default = "default_part_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_max_parts() -> usize {
    8
}

fn default_part_timeout_ms() -> u64 {
    600_000
}

/// Data-driven batch fan-out over tabular rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArpeggioSpec {
    /// Path to a JSON/YAML file holding an array of row objects.
    /// Absent when the host injects a row source directly.
    #[serde(default)]
    pub source: Option<String>,
    /// Batch prompt template; `{{<i>.<column>}}` substitutes row fields
    pub prompt: String,
    /// Rows per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries per batch beyond the first attempt
    #[serde(default)]
    pub max_retries: u32,
    /// Delay between batch retry attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How batch outputs are combined
    #[serde(default)]
    pub merge: MergeStrategy,
    /// Write the merged output here as a side effect
    #[serde(default)]
    pub output_path: Option<String>,
}

fn default_batch_size() -> usize {
    1
}

fn default_concurrency() -> usize {
    2
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

/// Merge strategy for arpeggio batch outputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Newline-joined in batch order
    #[default]
    Concat,
    /// Host-injected merge function over the ordered batch outcomes
    Custom,
}

/// An ordered movement-name cycle watched for back-to-back repeats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMonitor {
    /// The movement names forming one pass of the cycle
    pub cycle: Vec<String>,
    /// Consecutive repeats that trigger the judge
    pub threshold: u32,
    /// Judge override; a built-in bilingual template applies when absent
    #[serde(default)]
    pub judge: Option<JudgeSpec>,
}

/// Custom judge definition for a cycle monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeSpec {
    pub persona: String,
    pub instruction: String,
    pub rules: Vec<Rule>,
}

/// Substitute `{{name}}` placeholders from a variables map.
/// Unknown placeholders are left untouched.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in variables {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_markers() {
        assert!(is_terminal(COMPLETE));
        assert!(is_terminal(ABORT));
        assert!(!is_terminal("review"));
    }

    #[test]
    fn test_render_substitution() {
        let mut vars = HashMap::new();
        vars.insert("project".to_string(), "maestro".to_string());

        let out = render("Work on {{project}}; keep {{unknown}} as-is", &vars);
        assert_eq!(out, "Work on maestro; keep {{unknown}} as-is");
    }

    #[test]
    fn test_deserialize_piece_from_yaml() {
        let yaml = r#"
name: review-loop
initial: plan
max_movements: 10
movements:
  - name: plan
    persona: planner
    instruction: "Plan the work"
    rules:
      - condition: "plan ready"
        next: implement
  - name: implement
    persona: coder
    instruction: "Do the work"
    reports: ["summary.md"]
    rules:
      - condition: "looks good"
        judge: true
        next: COMPLETE
      - condition: "needs rework"
        next: plan
cycle_monitors:
  - cycle: [plan, implement]
    threshold: 2
"#;

        let piece: PieceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(piece.name, "review-loop");
        assert_eq!(piece.movements.len(), 2);
        assert_eq!(piece.max_movements, 10);

        let implement = piece.movement("implement").unwrap();
        assert!(implement.rules[0].judge);
        assert_eq!(implement.reports, vec!["summary.md".to_string()]);
        assert!(!implement.edit);

        assert_eq!(piece.cycle_monitors.len(), 1);
        assert_eq!(piece.cycle_monitors[0].threshold, 2);
    }

    #[test]
    fn test_fan_out_count() {
        let yaml = r#"
name: solo
persona: worker
instruction: "go"
parallel:
  movements:
    - name: a
      persona: p
      instruction: "do a"
"#;
        let movement: Movement = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(movement.fan_out_count(), 1);
    }

    #[test]
    fn test_arpeggio_defaults() {
        let yaml = r#"
prompt: "Process {{0.name}}"
"#;
        let spec: ArpeggioSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.batch_size, 1);
        assert_eq!(spec.concurrency, 2);
        assert_eq!(spec.max_retries, 0);
        assert_eq!(spec.merge, MergeStrategy::Concat);
    }
}
