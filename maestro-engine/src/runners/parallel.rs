// Parallel Runner
// Fixed list of named sub-movements executed concurrently

use crate::agent::{AgentResponse, AgentStatus};
use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::execution::movement::MovementExecutor;
use crate::execution::rules::RuleEvaluator;
use crate::runners::DispatchOutcome;
use crate::score::{Movement, ParallelSpec, SubMovement};
use crate::session::branch_session_key;

use std::collections::HashMap;
use std::sync::Arc;

/// Runs a declared list of sub-movements concurrently, each through its
/// own three-phase protocol under its own persona and session key, and
/// evaluates the parent's rules once against the ordered aggregate.
pub struct ParallelRunner {
    executor: MovementExecutor,
    evaluator: Arc<RuleEvaluator>,
    piece: String,
    cwd: String,
}

impl ParallelRunner {
    pub fn new(
        executor: MovementExecutor,
        evaluator: Arc<RuleEvaluator>,
        piece: String,
        cwd: String,
    ) -> Self {
        Self {
            executor,
            evaluator,
            piece,
            cwd,
        }
    }

    pub async fn run(
        &self,
        parent: &Movement,
        spec: &ParallelSpec,
        sessions: &HashMap<String, String>,
        cancel: &CancelToken,
    ) -> EngineResult<DispatchOutcome> {
        let mut handles = Vec::with_capacity(spec.movements.len());
        for sub in &spec.movements {
            let movement = branch_movement(parent, sub);
            let key = branch_session_key(&self.piece, &parent.name, &sub.name);
            let prior = sessions.get(&key).cloned();
            let executor = self.executor.clone();
            let instruction = sub.instruction.clone();
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                executor
                    .run(&movement, &instruction, &key, prior, &cancel)
                    .await
            });
            handles.push((sub.name.clone(), handle));
        }

        // Aggregate in declaration order, never completion order
        let mut sections = Vec::with_capacity(handles.len());
        let mut session_updates = Vec::new();
        let mut failures = 0;

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) => {
                    if outcome.response.status == AgentStatus::Done {
                        sections.push(format!("## {name}\n{}", outcome.response.content));
                    } else {
                        failures += 1;
                        sections.push(format!(
                            "## {name}\n[ERROR] {}",
                            outcome.response.failure_reason()
                        ));
                    }
                    if let Some(update) = outcome.session_update {
                        session_updates.push(update);
                    }
                }
                Ok(Err(err)) => {
                    failures += 1;
                    sections.push(format!("## {name}\n[ERROR] {err}"));
                }
                Err(join_err) => {
                    failures += 1;
                    sections.push(format!("## {name}\n[ERROR] branch task failed: {join_err}"));
                }
            }
        }

        if failures == spec.movements.len() {
            return Err(EngineError::AllBranchesFailed(parent.name.clone()));
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

/// Expand one branch into a rule-less movement inheriting the parent's
/// call overrides. Branch output is judged only as part of the aggregate.
fn branch_movement(parent: &Movement, sub: &SubMovement) -> Movement {
    Movement {
        name: sub.name.clone(),
        persona: sub.persona.clone(),
        rules: Vec::new(),
        instruction: sub.instruction.clone(),
        parallel: None,
        team_leader: None,
        arpeggio: None,
        allowed_tools: parent.allowed_tools.clone(),
        permission_mode: parent.permission_mode.clone(),
        provider: parent.provider.clone(),
        model: parent.model.clone(),
        max_turns: parent.max_turns,
        reports: Vec::new(),
        edit: parent.edit,
        fresh_session: parent.fresh_session,
        timeout_ms: parent.timeout_ms,
    }
}
