// Loop and Cycle Detection
// Same-movement streaks and multi-movement repeating-cycle monitors

use crate::score::{CycleMonitor, LoopThresholds, Movement, Rule, COMPLETE};

use std::collections::HashMap;

/// Name (and decision-tag label) of the synthetic judge movement
pub const CYCLE_JUDGE: &str = "CYCLE_JUDGE";

/// Built-in bilingual judge instruction, used when a monitor carries no
/// custom judge definition. `{{cycle}}` and `{{count}}` are filled in.
const DEFAULT_JUDGE_INSTRUCTION: &str = "\
The piece has executed the cycle {{cycle}} {{count}} times back-to-back.
Review the recent outputs and decide whether another pass is worthwhile.
Reply with [CYCLE_JUDGE:1] to run the cycle again, or [CYCLE_JUDGE:2] to stop here.

工作流已连续重复执行循环 {{cycle}} 共 {{count}} 次。
请根据最近的输出判断是否值得再执行一轮。
若应再次执行该循环，请回复 [CYCLE_JUDGE:1]；若应停止，请回复 [CYCLE_JUDGE:2]。";

/// Verdict for the same-movement streak, checked before a movement runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    Ok,
    /// Streak crossed the soft threshold
    Warn(u32),
    /// Streak crossed the hard threshold
    Abort(u32),
}

/// Tracks how many times in a row the same movement has run
#[derive(Debug)]
pub struct LoopDetector {
    warn: u32,
    abort: u32,
    last: Option<String>,
    streak: u32,
}

impl LoopDetector {
    pub fn new(thresholds: LoopThresholds) -> Self {
        Self {
            warn: thresholds.warn,
            abort: thresholds.abort,
            last: None,
            streak: 0,
        }
    }

    /// Record that `movement` is about to run and report the streak verdict
    pub fn record(&mut self, movement: &str) -> LoopVerdict {
        if self.last.as_deref() == Some(movement) {
            self.streak += 1;
        } else {
            self.last = Some(movement.to_string());
            self.streak = 1;
        }

        if self.streak >= self.abort {
            LoopVerdict::Abort(self.streak)
        } else if self.streak >= self.warn {
            LoopVerdict::Warn(self.streak)
        } else {
            LoopVerdict::Ok
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    monitor: CycleMonitor,
    repeats: u32,
    /// History position where the last counted repeat ended
    last_match_end: Option<usize>,
}

/// Watches the sequence of completed movements for exact back-to-back
/// repeats of each configured cycle.
#[derive(Debug)]
pub struct CycleDetector {
    monitors: Vec<MonitorState>,
    history: Vec<String>,
}

impl CycleDetector {
    pub fn new(monitors: Vec<CycleMonitor>) -> Self {
        Self {
            monitors: monitors
                .into_iter()
                .map(|monitor| MonitorState {
                    monitor,
                    repeats: 0,
                    last_match_end: None,
                })
                .collect(),
            history: Vec::new(),
        }
    }

    /// Record a completed movement; returns the index of the first monitor
    /// whose repeat threshold was reached, if any.
    pub fn record(&mut self, movement: &str) -> Option<usize> {
        self.history.push(movement.to_string());
        let end = self.history.len();

        let mut triggered = None;
        for (idx, state) in self.monitors.iter_mut().enumerate() {
            let len = state.monitor.cycle.len();
            if end < len {
                continue;
            }

            let tail = &self.history[end - len..];
            if tail.iter().zip(&state.monitor.cycle).all(|(a, b)| a == b) {
                // Back-to-back means the previous counted repeat ended
                // exactly one cycle length ago
                state.repeats = match state.last_match_end {
                    Some(prev) if prev + len == end => state.repeats + 1,
                    _ => 1,
                };
                state.last_match_end = Some(end);

                if state.repeats >= state.monitor.threshold && triggered.is_none() {
                    triggered = Some(idx);
                }
            }
        }

        triggered
    }

    pub fn monitor(&self, idx: usize) -> &CycleMonitor {
        &self.monitors[idx].monitor
    }

    pub fn repeats(&self, idx: usize) -> u32 {
        self.monitors[idx].repeats
    }

    /// Reset a monitor's counter. Runs unconditionally after its judge,
    /// whatever the judge decided.
    pub fn reset(&mut self, idx: usize) {
        self.monitors[idx].repeats = 0;
        self.monitors[idx].last_match_end = None;
    }

    /// Build the synthetic judge movement for a triggered monitor
    pub fn judge_movement(monitor: &CycleMonitor, repeats: u32) -> Movement {
        let (persona, instruction, rules) = match &monitor.judge {
            Some(judge) => (
                judge.persona.clone(),
                judge.instruction.clone(),
                judge.rules.clone(),
            ),
            None => {
                let mut vars = HashMap::new();
                vars.insert("cycle".to_string(), monitor.cycle.join(" -> "));
                vars.insert("count".to_string(), repeats.to_string());
                let instruction = crate::score::render(DEFAULT_JUDGE_INSTRUCTION, &vars);

                let rules = vec![
                    Rule::text("run the cycle again", monitor.cycle[0].clone()),
                    Rule::text("stop", COMPLETE),
                ];
                ("judge".to_string(), instruction, rules)
            }
        };

        Movement {
            name: CYCLE_JUDGE.to_string(),
            persona,
            rules,
            instruction,
            parallel: None,
            team_leader: None,
            arpeggio: None,
            allowed_tools: Some(Vec::new()),
            permission_mode: None,
            provider: None,
            model: None,
            max_turns: None,
            reports: Vec::new(),
            edit: false,
            fresh_session: true,
            timeout_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::JudgeSpec;

    fn monitor(cycle: &[&str], threshold: u32) -> CycleMonitor {
        CycleMonitor {
            cycle: cycle.iter().map(|s| s.to_string()).collect(),
            threshold,
            judge: None,
        }
    }

    #[test]
    fn test_loop_detector_streak() {
        let mut detector = LoopDetector::new(LoopThresholds { warn: 3, abort: 5 });

        assert_eq!(detector.record("a"), LoopVerdict::Ok);
        assert_eq!(detector.record("a"), LoopVerdict::Ok);
        assert_eq!(detector.record("a"), LoopVerdict::Warn(3));
        assert_eq!(detector.record("a"), LoopVerdict::Warn(4));
        assert_eq!(detector.record("a"), LoopVerdict::Abort(5));
    }

    #[test]
    fn test_loop_detector_resets_on_other_movement() {
        let mut detector = LoopDetector::new(LoopThresholds { warn: 2, abort: 3 });

        assert_eq!(detector.record("a"), LoopVerdict::Ok);
        assert_eq!(detector.record("a"), LoopVerdict::Warn(2));
        assert_eq!(detector.record("b"), LoopVerdict::Ok);
        assert_eq!(detector.record("a"), LoopVerdict::Ok);
    }

    #[test]
    fn test_cycle_triggers_after_threshold_repeats() {
        let mut detector = CycleDetector::new(vec![monitor(&["plan", "implement", "review"], 2)]);

        for name in ["plan", "implement", "review", "plan", "implement"] {
            assert_eq!(detector.record(name), None);
        }
        assert_eq!(detector.record("review"), Some(0));
        assert_eq!(detector.repeats(0), 2);
    }

    #[test]
    fn test_interleaved_movement_breaks_the_run() {
        let mut detector = CycleDetector::new(vec![monitor(&["a", "b"], 2)]);

        assert_eq!(detector.record("a"), None);
        assert_eq!(detector.record("b"), None); // one repeat
        assert_eq!(detector.record("c"), None); // breaks back-to-back
        assert_eq!(detector.record("a"), None);
        assert_eq!(detector.record("b"), None); // counts as the first again
        assert_eq!(detector.record("a"), None);
        assert_eq!(detector.record("b"), Some(0));
    }

    #[test]
    fn test_reset_restarts_counting() {
        let mut detector = CycleDetector::new(vec![monitor(&["a", "b"], 2)]);

        detector.record("a");
        detector.record("b");
        detector.record("a");
        assert_eq!(detector.record("b"), Some(0));

        detector.reset(0);
        detector.record("a");
        assert_eq!(detector.record("b"), None);
        detector.record("a");
        assert_eq!(detector.record("b"), Some(0));
    }

    #[test]
    fn test_default_judge_movement_is_bilingual_and_routes_back() {
        let m = monitor(&["plan", "implement"], 2);
        let judge = CycleDetector::judge_movement(&m, 2);

        assert_eq!(judge.name, CYCLE_JUDGE);
        assert!(judge.instruction.contains("[CYCLE_JUDGE:1]"));
        assert!(judge.instruction.contains("plan -> implement"));
        assert!(judge.instruction.contains("工作流"));
        assert_eq!(judge.rules[0].next, "plan");
        assert_eq!(judge.rules[1].next, COMPLETE);
        assert!(judge.fresh_session);
    }

    #[test]
    fn test_custom_judge_movement() {
        let mut m = monitor(&["a", "b"], 1);
        m.judge = Some(JudgeSpec {
            persona: "arbiter".to_string(),
            instruction: "Decide.".to_string(),
            rules: vec![Rule::text("keep going", "a")],
        });

        let judge = CycleDetector::judge_movement(&m, 1);
        assert_eq!(judge.persona, "arbiter");
        assert_eq!(judge.instruction, "Decide.");
        assert_eq!(judge.rules.len(), 1);
    }
}
