// Team-Leader Runner
// A leader call decomposes the instruction into concurrently executed parts

use crate::agent::{
    AgentCall, AgentEventSender, AgentResponse, AgentStatus, CallOptions,
};
use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::execution::rules::RuleEvaluator;
use crate::runners::DispatchOutcome;
use crate::score::{Movement, TeamLeaderSpec};

use regex::Regex;
use serde::Deserialize;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// One unit of work produced by the leader's decomposition
#[derive(Debug, Clone, Deserialize)]
pub struct PartDefinition {
    pub id: String,
    pub title: String,
    pub instruction: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A part paired with its settled response
#[derive(Debug, Clone)]
pub struct PartResult {
    pub part: PartDefinition,
    pub response: AgentResponse,
}

impl PartResult {
    pub fn failed(&self) -> bool {
        self.response.status != AgentStatus::Done
    }
}

/// Dynamic decomposition fan-out: one leader call splits the instruction
/// into parts, every part runs as an isolated fresh-session single-turn
/// call, and the parent's rules are evaluated against the ordered aggregate.
pub struct TeamLeaderRunner {
    agent: Arc<dyn AgentCall>,
    evaluator: Arc<RuleEvaluator>,
    agent_events: Option<AgentEventSender>,
    cwd: String,
}

impl TeamLeaderRunner {
    pub fn new(agent: Arc<dyn AgentCall>, evaluator: Arc<RuleEvaluator>, cwd: String) -> Self {
        Self {
            agent,
            evaluator,
            agent_events: None,
            cwd,
        }
    }

    pub fn with_agent_events(mut self, agent_events: Option<AgentEventSender>) -> Self {
        self.agent_events = agent_events;
        self
    }

    pub async fn run(
        &self,
        parent: &Movement,
        spec: &TeamLeaderSpec,
        instruction: &str,
        session_key: &str,
        prior_session: Option<String>,
        cancel: &CancelToken,
    ) -> EngineResult<DispatchOutcome> {
        // Leader call: decompose the instruction into parts
        let leader_instruction = leader_prompt(instruction, spec.max_parts);
        let leader_cancel =
            cancel.child_with_timeout(parent.timeout_ms.map(Duration::from_millis));
        let resume = if parent.fresh_session {
            None
        } else {
            prior_session
        };

        let leader = self
            .agent
            .call(
                &parent.persona,
                &leader_instruction,
                CallOptions {
                    cwd: self.cwd.clone(),
                    cancel: Some(leader_cancel),
                    allowed_tools: parent.allowed_tools.clone(),
                    provider: parent.provider.clone(),
                    model: parent.model.clone(),
                    permission_mode: parent.permission_mode.clone(),
                    session_id: resume,
                    max_turns: parent.max_turns,
                    progress: self.agent_events.clone(),
                },
            )
            .await;

        if leader.status != AgentStatus::Done {
            return Err(EngineError::Decomposition(format!(
                "leader call failed: {}",
                leader.failure_reason()
            )));
        }

        let mut session_updates = Vec::new();
        if let Some(id) = leader.session_id.clone() {
            session_updates.push((session_key.to_string(), id));
        }

        let parts = parse_parts(&leader.content, spec.max_parts)?;
        tracing::debug!(movement = %parent.name, parts = parts.len(), "decomposed into parts");

        // Every part runs concurrently, isolated, under its own timeout.
        // A failing part never cancels its siblings.
        let mut handles = Vec::with_capacity(parts.len());
        for part in parts {
            let agent = Arc::clone(&self.agent);
            let cwd = self.cwd.clone();
            let persona = parent.persona.clone();
            let provider = parent.provider.clone();
            let model = parent.model.clone();
            let permission_mode = parent.permission_mode.clone();
            let allowed_tools = parent.allowed_tools.clone();
            let timeout = Duration::from_millis(part.timeout_ms.unwrap_or(spec.default_timeout_ms));
            let part_cancel = cancel.child_with_timeout(Some(timeout));
            let instruction = part.instruction.clone();
            let part_name = part.id.clone();
            // Parts stream onto the same channel as the leader; events
            // interleave and carry no part label
            let agent_events = self.agent_events.clone();

            let handle = tokio::spawn(async move {
                let mut response = agent
                    .call(
                        &persona,
                        &instruction,
                        CallOptions {
                            cwd,
                            cancel: Some(part_cancel.clone()),
                            allowed_tools,
                            provider,
                            model,
                            permission_mode,
                            session_id: None,
                            max_turns: Some(1),
                            progress: agent_events,
                        },
                    )
                    .await;
                response.movement = part_name;
                if response.status != AgentStatus::Done {
                    if let Some(reason) = part_cancel.reason() {
                        response.status = AgentStatus::Interrupted;
                        response.error = Some(reason.as_str().to_string());
                    }
                }
                PartResult { part, response }
            });
            handles.push(handle);
        }

        // Settle in declaration order
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    return Err(EngineError::Internal(format!(
                        "part task failed: {join_err}"
                    )))
                }
            }
        }

        if results.iter().all(PartResult::failed) {
            return Err(EngineError::AllPartsFailed {
                ids: results.iter().map(|r| r.part.id.clone()).collect(),
            });
        }

        // Decomposition first, then every part's labeled output
        let mut sections = vec![leader.content.clone()];
        for result in &results {
            let body = if result.failed() {
                format!("[ERROR] {}", result.response.failure_reason())
            } else {
                result.response.content.clone()
            };
            sections.push(format!("## {}: {}\n{body}", result.part.id, result.part.title));
        }
        let content = sections.join("\n\n");

        let matched = self
            .evaluator
            .evaluate(&content, &parent.name, &parent.rules, &self.cwd)
            .await;

        let mut response = AgentResponse::done(&parent.name, &parent.persona, content);
        if let Some(m) = matched {
            response.matched_rule = Some(m.index);
            response.match_method = Some(m.method);
        }

        Ok(DispatchOutcome {
            response,
            session_updates,
        })
    }
}

fn leader_prompt(instruction: &str, max_parts: usize) -> String {
    format!(
        "{instruction}\n\nSplit this work into at most {max_parts} independent parts. \
         Reply with exactly one fenced JSON block holding an array of objects with \
         fields \"id\", \"title\", \"instruction\" and optional \"timeout_ms\"."
    )
}

/// Extract and validate the decomposition from the leader's output.
/// Missing or malformed block, duplicate ids and an over-cap count are
/// hard errors.
pub fn parse_parts(content: &str, max_parts: usize) -> EngineResult<Vec<PartDefinition>> {
    let re = Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let block = re
        .captures(content)
        .and_then(|c| c.get(1))
        .ok_or_else(|| {
            EngineError::Decomposition("no fenced JSON block in leader output".to_string())
        })?;

    let parts: Vec<PartDefinition> = serde_json::from_str(block.as_str())
        .map_err(|e| EngineError::Decomposition(format!("malformed part list: {e}")))?;

    if parts.is_empty() {
        return Err(EngineError::Decomposition(
            "leader produced zero parts".to_string(),
        ));
    }
    if parts.len() > max_parts {
        return Err(EngineError::Decomposition(format!(
            "leader produced {} parts, cap is {max_parts}",
            parts.len()
        )));
    }

    let mut seen = HashSet::new();
    for part in &parts {
        if !seen.insert(part.id.as_str()) {
            return Err(EngineError::Decomposition(format!(
                "duplicate part id: {}",
                part.id
            )));
        }
    }

    Ok(parts)
}
