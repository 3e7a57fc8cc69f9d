// Movement Executor
// Runs one ordinary movement through the three-phase protocol

use crate::agent::{
    AgentCall, AgentEventSender, AgentResponse, AgentStatus, CallOptions,
};
use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::execution::events::{EventSender, Phase, PieceEvent, ProgressSender};
use crate::execution::rules::{RuleEvaluator, RuleMatch};
use crate::score::Movement;

use std::sync::Arc;
use std::time::Duration;

/// Tools withheld when a movement declares output-contract files without
/// the edit flag
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit", "Bash"];

/// Baseline allow-list used when withholding from an unrestricted movement
const READ_TOOLS: &[&str] = &["Read", "Grep", "Glob", "WebFetch", "WebSearch"];

/// Result of one movement run
#[derive(Debug, Clone)]
pub struct MovementOutcome {
    /// Settled response; content covers every phase that ran
    pub response: AgentResponse,
    /// The instruction Phase 1 was invoked with
    pub instruction: String,
    /// Session-key -> session-id update to merge back, if any
    pub session_update: Option<(String, String)>,
}

/// Executes one ordinary movement: execute, report, status judgment
#[derive(Clone)]
pub struct MovementExecutor {
    agent: Arc<dyn AgentCall>,
    evaluator: Arc<RuleEvaluator>,
    events: Option<ProgressSender>,
    agent_events: Option<AgentEventSender>,
    cwd: String,
}

impl MovementExecutor {
    pub fn new(agent: Arc<dyn AgentCall>, evaluator: Arc<RuleEvaluator>, cwd: String) -> Self {
        Self {
            agent,
            evaluator,
            events: None,
            agent_events: None,
            cwd,
        }
    }

    pub fn with_events(mut self, events: Option<ProgressSender>) -> Self {
        self.events = events;
        self
    }

    pub fn with_agent_events(mut self, agent_events: Option<AgentEventSender>) -> Self {
        self.agent_events = agent_events;
        self
    }

    /// Run the three-phase protocol for `movement`.
    ///
    /// Phase 1 failures come back as the response's own status; Phase 2/3
    /// failures (after their single retry, where one exists) are fatal.
    pub async fn run(
        &self,
        movement: &Movement,
        instruction: &str,
        session_key: &str,
        prior_session: Option<String>,
        cancel: &CancelToken,
    ) -> EngineResult<MovementOutcome> {
        let timeout = movement.timeout_ms.map(Duration::from_millis);

        // Phase 1: execute
        self.events
            .send_event(PieceEvent::phase_start(&movement.name, Phase::Execute));

        let call_cancel = cancel.child_with_timeout(timeout);
        let resume = if movement.fresh_session {
            None
        } else {
            prior_session.clone()
        };

        let options = CallOptions {
            cwd: self.cwd.clone(),
            cancel: Some(call_cancel.clone()),
            allowed_tools: phase_one_tools(movement),
            provider: movement.provider.clone(),
            model: movement.model.clone(),
            permission_mode: movement.permission_mode.clone(),
            session_id: resume,
            max_turns: movement.max_turns,
            progress: self.agent_events.clone(),
        };

        let mut response = self
            .agent
            .call(&movement.persona, instruction, options)
            .await;
        response.movement = movement.name.clone();
        response.persona = movement.persona.clone();

        if response.status != AgentStatus::Done {
            if let Some(reason) = call_cancel.reason() {
                response.status = AgentStatus::Interrupted;
                response.error = Some(reason.as_str().to_string());
            }
        }

        self.events.send_event(PieceEvent::phase_complete(
            &movement.name,
            Phase::Execute,
            response.status,
        ));

        // Session continuity: adopt the id the provider handed back
        let mut session = response.session_id.clone().or(prior_session);

        if response.status != AgentStatus::Done {
            let session_update = session
                .clone()
                .map(|id| (session_key.to_string(), id));
            return Ok(MovementOutcome {
                response,
                instruction: instruction.to_string(),
                session_update,
            });
        }

        let mut content = response.content.clone();
        let mut matched = self
            .evaluator
            .evaluate(&content, &movement.name, &movement.rules, &self.cwd)
            .await;

        // Phase 2: report, only when declared and Phase 1 was not decisive
        if matched.is_none() && !movement.reports.is_empty() {
            self.events
                .send_event(PieceEvent::phase_start(&movement.name, Phase::Report));

            for file in &movement.reports {
                let report = self
                    .collect_report(movement, file, &mut session, cancel, timeout)
                    .await?;

                self.events.send_event(PieceEvent::movement_report(
                    &movement.name,
                    file,
                    report.clone(),
                ));
                content.push_str(&format!("\n\n## Report: {file}\n{report}"));
            }

            self.events.send_event(PieceEvent::phase_complete(
                &movement.name,
                Phase::Report,
                AgentStatus::Done,
            ));

            matched = self
                .evaluator
                .evaluate(&content, &movement.name, &movement.rules, &self.cwd)
                .await;
        }

        // Phase 3: status judgment, tag tier only
        if matched.is_none() && !movement.rules.is_empty() {
            matched = self
                .status_judgment(movement, session.clone(), cancel, timeout)
                .await?;
        }

        response.content = content;
        if let Some(RuleMatch { index, method }) = matched {
            response.matched_rule = Some(index);
            response.match_method = Some(method);
        }

        let session_update = session.map(|id| (session_key.to_string(), id));
        Ok(MovementOutcome {
            response,
            instruction: instruction.to_string(),
            session_update,
        })
    }

    /// Phase 2 for one named report: resume read-only, retry exactly once
    /// with a brand-new session, fail the movement on a second miss.
    async fn collect_report(
        &self,
        movement: &Movement,
        file: &str,
        session: &mut Option<String>,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> EngineResult<String> {
        let request = format!(
            "Return the full content of the report \"{file}\" produced in this session. \
             Output only the report body, nothing else."
        );

        let first = self
            .read_only_call(movement, &request, session.clone(), cancel, timeout)
            .await;

        if first.status == AgentStatus::Done && !first.is_effectively_empty() {
            if first.session_id.is_some() {
                *session = first.session_id;
            }
            return Ok(first.content);
        }

        tracing::debug!(
            movement = %movement.name,
            file,
            "report attempt failed; retrying with a fresh session"
        );

        // Brand-new session, prior content carried forward as context
        let retry_request = format!(
            "{request}\n\nThe prior attempt produced:\n{}",
            first.content
        );
        let second = self
            .read_only_call(movement, &retry_request, None, cancel, timeout)
            .await;

        if second.status == AgentStatus::Done && !second.is_effectively_empty() {
            return Ok(second.content);
        }

        let reason = if second.status != AgentStatus::Done {
            second.failure_reason()
        } else {
            "empty content".to_string()
        };
        Err(EngineError::ReportPhase {
            file: file.to_string(),
            reason,
        })
    }

    /// Phase 3: resume read-only and request specifically the decision tag
    async fn status_judgment(
        &self,
        movement: &Movement,
        session: Option<String>,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> EngineResult<Option<RuleMatch>> {
        self.events.send_event(PieceEvent::phase_start(
            &movement.name,
            Phase::StatusJudgment,
        ));

        let choices = movement
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| format!("{}. {}", i + 1, rule.condition))
            .collect::<Vec<_>>()
            .join("\n");
        let request = format!(
            "Reply with exactly one decision tag of the form [{}:<n>] selecting the option \
             that best describes the outcome of this session:\n{choices}",
            movement.name
        );

        let response = self
            .read_only_call(movement, &request, session, cancel, timeout)
            .await;

        self.events.send_event(PieceEvent::phase_complete(
            &movement.name,
            Phase::StatusJudgment,
            response.status,
        ));

        if response.status != AgentStatus::Done {
            return Err(EngineError::StatusPhase {
                movement: movement.name.clone(),
                reason: response.failure_reason(),
            });
        }

        Ok(self
            .evaluator
            .match_tag(&response.content, &movement.name, &movement.rules))
    }

    /// A single-turn call with no tool access
    async fn read_only_call(
        &self,
        movement: &Movement,
        instruction: &str,
        session_id: Option<String>,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> AgentResponse {
        let call_cancel = cancel.child_with_timeout(timeout);
        let options = CallOptions {
            cwd: self.cwd.clone(),
            cancel: Some(call_cancel.clone()),
            allowed_tools: Some(Vec::new()),
            provider: movement.provider.clone(),
            model: movement.model.clone(),
            permission_mode: movement.permission_mode.clone(),
            session_id,
            max_turns: Some(1),
            progress: self.agent_events.clone(),
        };

        let mut response = self
            .agent
            .call(&movement.persona, instruction, options)
            .await;

        if response.status != AgentStatus::Done {
            if let Some(reason) = call_cancel.reason() {
                response.status = AgentStatus::Interrupted;
                response.error = Some(reason.as_str().to_string());
            }
        }
        response
    }
}

/// Phase-1 tool allow-list: withhold write-capable tools when the movement
/// declares output-contract files without the edit flag.
fn phase_one_tools(movement: &Movement) -> Option<Vec<String>> {
    if movement.reports.is_empty() || movement.edit {
        return movement.allowed_tools.clone();
    }

    match &movement.allowed_tools {
        Some(tools) => Some(
            tools
                .iter()
                .filter(|t| !WRITE_TOOLS.contains(&t.as_str()))
                .cloned()
                .collect(),
        ),
        None => Some(READ_TOOLS.iter().map(|s| (*s).to_string()).collect()),
    }
}
