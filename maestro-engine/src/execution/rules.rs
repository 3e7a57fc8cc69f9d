// Rule Evaluation
// Three-tier matching of movement output against configured rules

use crate::agent::{JudgeCall, MatchMethod};
use crate::score::Rule;

use regex::{Regex, RegexBuilder};

use std::sync::Arc;

/// A resolved rule match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch {
    pub index: usize,
    pub method: MatchMethod,
}

/// Tier (a): explicit numbered decision tags.
///
/// Behind a trait so the tag grammar can be swapped without touching the
/// other tiers.
pub trait TagDetector: Send + Sync {
    /// Rule index selected by a `[<MOVEMENT>:<N>]` tag in `content`, if any
    fn detect(&self, content: &str, movement: &str) -> Option<usize>;
}

/// Default detector: `[<MOVEMENT>:<N>]`, last occurrence wins, N is 1-based
pub struct RegexTagDetector;

impl TagDetector for RegexTagDetector {
    fn detect(&self, content: &str, movement: &str) -> Option<usize> {
        let pattern = format!(r"\[{}:(\d+)\]", regex::escape(movement));
        let re = Regex::new(&pattern).ok()?;

        let n: usize = re
            .captures_iter(content)
            .last()?
            .get(1)?
            .as_str()
            .parse()
            .ok()?;

        // Tags are 1-based
        n.checked_sub(1)
    }
}

/// Three-tier rule evaluator: tag, judge, then literal/regex text match.
/// First decisive tier wins; tag matches short-circuit the judge.
pub struct RuleEvaluator {
    tag: Box<dyn TagDetector>,
    judge: Arc<dyn JudgeCall>,
}

impl RuleEvaluator {
    pub fn new(judge: Arc<dyn JudgeCall>) -> Self {
        Self {
            tag: Box::new(RegexTagDetector),
            judge,
        }
    }

    /// Replace the tag tier
    pub fn with_tag_detector(mut self, tag: Box<dyn TagDetector>) -> Self {
        self.tag = tag;
        self
    }

    /// Tier (a) only, used by Phase 3
    pub fn match_tag(&self, content: &str, movement: &str, rules: &[Rule]) -> Option<RuleMatch> {
        let index = self.tag.detect(content, movement)?;
        if index < rules.len() {
            Some(RuleMatch {
                index,
                method: MatchMethod::Tag,
            })
        } else {
            None
        }
    }

    /// Run all three tiers in order against `content`
    pub async fn evaluate(
        &self,
        content: &str,
        movement: &str,
        rules: &[Rule],
        cwd: &str,
    ) -> Option<RuleMatch> {
        if rules.is_empty() {
            return None;
        }

        // Tier (a)
        if let Some(m) = self.match_tag(content, movement, rules) {
            return Some(m);
        }

        // Tier (b): judge-typed conditions, labeled by rule index
        let labeled: Vec<(usize, String)> = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.judge)
            .map(|(i, r)| (i, r.condition.clone()))
            .collect();

        if !labeled.is_empty() {
            if let Some(index) = self.judge.judge(content, &labeled, cwd).await {
                if labeled.iter().any(|(i, _)| *i == index) {
                    return Some(RuleMatch {
                        index,
                        method: MatchMethod::Judge,
                    });
                }
                tracing::warn!(index, movement, "judge returned an unlabeled rule index");
            }
        }

        // Tier (c): literal/regex, case-insensitive; judge-typed rules are
        // semantic descriptions, not text patterns, so they are skipped here
        for (index, rule) in rules.iter().enumerate() {
            if rule.judge {
                continue;
            }
            if text_matches(content, &rule.condition) {
                return Some(RuleMatch {
                    index,
                    method: MatchMethod::Text,
                });
            }
        }

        None
    }
}

/// Case-insensitive condition match: regex when the condition compiles,
/// literal substring otherwise.
fn text_matches(content: &str, condition: &str) -> bool {
    match RegexBuilder::new(condition).case_insensitive(true).build() {
        Ok(re) => re.is_match(content),
        Err(_) => content.to_lowercase().contains(&condition.to_lowercase()),
    }
}
