// Agent Interfaces
// Traits and types for the external agent-call, judge and streaming collaborators

use crate::cancel::CancelToken;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Terminal status of one agent call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// The call completed normally
    Done,
    /// The agent reported it cannot proceed without a host decision
    Blocked,
    /// The call failed
    Error,
    /// The call was cancelled by an operator abort or timeout
    Interrupted,
}

/// How a rule was matched against movement output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    /// Explicit numbered decision tag
    Tag,
    /// Judge interface over labeled conditions
    Judge,
    /// Literal/regex condition match
    Text,
}

/// One settled agent response, as consumed by the engine
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// Movement (or branch) the call ran for
    pub movement: String,
    /// Persona the call ran under
    pub persona: String,
    pub status: AgentStatus,
    pub content: String,
    /// Session id to resume with, when the provider returned one
    pub session_id: Option<String>,
    /// Error text for error/interrupted statuses
    pub error: Option<String>,
    /// Index of the rule the output matched, when resolved
    pub matched_rule: Option<usize>,
    /// Tier the match came from
    pub match_method: Option<MatchMethod>,
    pub timestamp: DateTime<Utc>,
}

impl AgentResponse {
    pub fn done(
        movement: impl Into<String>,
        persona: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            movement: movement.into(),
            persona: persona.into(),
            status: AgentStatus::Done,
            content: content.into(),
            session_id: None,
            error: None,
            matched_rule: None,
            match_method: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(
        movement: impl Into<String>,
        persona: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        Self {
            movement: movement.into(),
            persona: persona.into(),
            status: AgentStatus::Error,
            content: String::new(),
            session_id: None,
            error: Some(error),
            matched_rule: None,
            match_method: None,
            timestamp: Utc::now(),
        }
    }

    /// Whether the content carries nothing usable
    pub fn is_effectively_empty(&self) -> bool {
        self.content.trim().is_empty()
    }

    /// Human-readable failure reason, falling back to content
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| self.content.clone())
    }
}

/// Typed streaming events the engine forwards to the host verbatim,
/// never interpreting them.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Init { session_id: String },
    Text { chunk: String },
    Thinking { chunk: String },
    ToolUse { name: String, input: serde_json::Value },
    ToolResult { name: String, output: String },
    Result { content: String },
    Error { message: String },
}

/// Sender half of the streaming progress callback
pub type AgentEventSender = mpsc::UnboundedSender<AgentEvent>;

/// Options for one agent call
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Working directory for the call
    pub cwd: String,
    /// Composed cancellation signal (timeout + parent abort)
    pub cancel: Option<CancelToken>,
    /// Tool allow-list; `None` leaves the provider default in place
    pub allowed_tools: Option<Vec<String>>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    /// Prior session id; absent means a fresh session
    pub session_id: Option<String>,
    pub max_turns: Option<u32>,
    /// Streaming progress callback
    pub progress: Option<AgentEventSender>,
}

/// The agent-call interface the engine drives
#[async_trait]
pub trait AgentCall: Send + Sync {
    async fn call(&self, persona: &str, instruction: &str, options: CallOptions) -> AgentResponse;
}

/// Secondary agent used to semantically match freeform content against a
/// labeled condition set. Labels are rule indices; `None` means no match.
#[async_trait]
pub trait JudgeCall: Send + Sync {
    async fn judge(
        &self,
        content: &str,
        conditions: &[(usize, String)],
        cwd: &str,
    ) -> Option<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_prefers_error_text() {
        let mut resp = AgentResponse::error("m", "p", "boom");
        resp.content = "partial output".to_string();
        assert_eq!(resp.failure_reason(), "boom");

        resp.error = Some("   ".to_string());
        assert_eq!(resp.failure_reason(), "partial output");
    }

    #[test]
    fn test_effectively_empty() {
        let resp = AgentResponse::done("m", "p", "  \n\t ");
        assert!(resp.is_effectively_empty());

        let resp = AgentResponse::done("m", "p", "text");
        assert!(!resp.is_effectively_empty());
    }
}
